use crate::response::Strategy;

#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the line framer buffer. A single command line must fit into it.
    pub line_buffer: usize,
    /// The upper bound for a command that spans several lines. See `command::PendingCommand`.
    pub max_command: usize,
    /// The largest raw payload a command may announce, e.g. with `data follows`.
    pub max_payload: usize,
    /// How the rendered frames and errors are delivered to the client.
    pub response_mode: Strategy,
    /// Initial size of the offscreen frame, in pixels.
    pub screen: (u32, u32),
    /// Should a batch that consisted only of failed commands still produce a frame?
    pub render_idle: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            line_buffer: 64 * 1024,
            max_command: 16 * 1024 * 1024,
            max_payload: 256 * 1024 * 1024,
            response_mode: Strategy::Queued,
            screen: (512, 512),
            render_idle: false,
        }
    }
}
