//! A crate that serves a render session: it reads commands from a descriptor, applies them to a
//! scene in batches and streams the rendered frames back.

mod builtins;
mod camera;
mod clip;
mod command;
mod config;
mod framer;
mod interp;
mod render;
mod response;
mod scene;
mod server;
mod stats;

pub use camera::Camera;
pub use clip::{compute_near_far, Bounds, CameraPose, ClippingRange};
pub use command::ProtocolError;
pub use config::Config;
pub use framer::{ByteSource, FdSource, FrameError, PayloadReader, Wait};
pub use interp::{CommandContext, CommandError, Flow, Interpreter, Shell};
pub use render::{FlatRenderer, Frame, Renderer};
pub use response::{
    ChannelError, DirectChannel, FdSink, Payload, QueuedChannel, Response, ResponseKind,
    ResponseSink, Strategy, WriterStatus,
};
pub use scene::Scene;
pub use server::{start, Server, SessionEnd};
pub use stats::SessionStats;
