//! The session driver: reads commands, runs them in batches and sends frames back.
//!
//! A session goes through four states:
//!
//! - `Await` blocks until the input is readable. This is the only place where the session
//!   thread may block.
//! - `Drain` runs every command that is immediately available, probing the input with a zero
//!   timeout between commands and after short reads. A burst of commands thus results in a
//!   single frame, however the transport splits it.
//! - `Render` produces at most one frame for the batch, or an acknowledgement when nothing
//!   changed, and goes back to `Await`.
//! - `Terminate` ends the session on EOF, a read or write failure or a protocol violation.

use crate::command::{self, Dispatch, PendingCommand, ProtocolError};
use crate::config::Config;
use crate::framer::{ByteSource, FrameError, Framed, LineReader, Wait};
use crate::interp::{CommandContext, Interpreter, Shell};
use crate::render::{FlatRenderer, Renderer};
use crate::response::{self, ChannelError, Response, ResponseSink};
use crate::scene::Scene;
use crate::stats::{ServerState, SessionStats};
use log::{debug, error, info, warn};
use std::io::Write;
use thiserror::Error;

/// How a session ended.
#[derive(Debug, Error)]
pub enum SessionEnd {
    #[error("the client closed the connection")]
    EndOfFile,
    #[error("{0}")]
    ReadFailed(FrameError),
    #[error("{0}")]
    WriteFailed(ChannelError),
    #[error("{0}")]
    Protocol(ProtocolError),
}

impl SessionEnd {
    /// Only an orderly close between commands counts as clean.
    pub fn is_clean(&self) -> bool {
        match self {
            SessionEnd::EndOfFile => true,
            _ => false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Batch {
    executed: usize,
    failed: usize,
}

enum State {
    Await,
    Drain,
    Render(Batch),
    Terminate(SessionEnd),
}

pub struct Server<S, I, R> {
    reader: LineReader<S>,
    pending: PendingCommand,
    interp: I,
    renderer: R,
    responses: Box<dyn ResponseSink>,
    scene: Scene,
    state: ServerState,
    render_idle: bool,
}

impl<S, I, R> Server<S, I, R>
where
    S: ByteSource,
    I: Interpreter,
    R: Renderer,
{
    pub fn new(
        config: &Config,
        source: S,
        interp: I,
        renderer: R,
        responses: Box<dyn ResponseSink>,
    ) -> Self {
        let (width, height) = config.screen;
        Self {
            reader: LineReader::new(source, config.line_buffer)
                .with_payload_limit(config.max_payload),
            pending: PendingCommand::new(config.max_command),
            interp,
            renderer,
            responses,
            scene: Scene::new(width, height),
            state: ServerState::new(),
            render_idle: config.render_idle,
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn stats(&self) -> SessionStats {
        self.state.report(self.reader.bytes_read())
    }

    /// Serves the session until it ends.
    pub fn run(&mut self) -> SessionEnd {
        let mut state = match self.responses.send(Response::greeting()) {
            Ok(()) => State::Await,
            Err(err) => State::Terminate(SessionEnd::WriteFailed(err)),
        };
        let mut end = loop {
            state = match state {
                State::Await => self.await_input(),
                State::Drain => self.drain(),
                State::Render(batch) => self.render(batch),
                State::Terminate(end) => break end,
            };
        };

        if let Err(err) = self.responses.shutdown() {
            error!("failed to deliver the remaining responses: {}", err);
            if end.is_clean() {
                end = SessionEnd::WriteFailed(err);
            }
        }

        if end.is_clean() {
            info!("session finished: {}", end);
        } else {
            error!(
                "session terminated after {} commands and {:.3}s: {}",
                self.state.command_count(),
                self.state.elapsed().as_secs_f64(),
                end
            );
        }
        match serde_json::to_string(&self.stats()) {
            Ok(json) => info!("session stats: {}", json),
            Err(err) => warn!("failed to serialize the session stats: {}", err),
        }
        end
    }

    fn await_input(&mut self) -> State {
        // A line left over from a batch that was cut short by a flush.
        if self.reader.has_line() {
            return State::Drain;
        }
        match self.reader.wait_readable(Wait::Forever) {
            Ok(_) => State::Drain,
            Err(err) => State::Terminate(SessionEnd::ReadFailed(err.into())),
        }
    }

    fn drain(&mut self) -> State {
        let mut batch = Batch::default();
        loop {
            let line = match self.reader.next_line() {
                Ok(Framed::Line(line)) => line,
                // A short read. The rest of the burst may already be there.
                Ok(Framed::Continue) => match self.reader.wait_readable(Wait::Immediate) {
                    Ok(true) => continue,
                    Ok(false) => return State::Render(batch),
                    Err(err) => return State::Terminate(SessionEnd::ReadFailed(err.into())),
                },
                Ok(Framed::EndOfFile) => return State::Terminate(self.end_of_file()),
                Err(err) => return State::Terminate(SessionEnd::ReadFailed(err)),
            };
            if let Err(err) = self.pending.append(line) {
                return State::Terminate(SessionEnd::Protocol(err));
            }
            if !self.pending.is_complete(&self.interp) {
                continue;
            }

            let script = self.pending.take();
            if script.trim().is_empty() {
                continue;
            }
            match self.dispatch(&script) {
                Ok(Dispatch::Continue) => batch.executed += 1,
                Ok(Dispatch::Break) => {
                    batch.executed += 1;
                    debug!("flush requested after {} commands", batch.executed);
                    return State::Render(batch);
                }
                Ok(Dispatch::Failed(_)) => batch.failed += 1,
                Err(end) => return State::Terminate(end),
            }

            if self.reader.has_line() {
                continue;
            }
            match self.reader.wait_readable(Wait::Immediate) {
                Ok(true) => {}
                Ok(false) => return State::Render(batch),
                Err(err) => return State::Terminate(SessionEnd::ReadFailed(err.into())),
            }
        }
    }

    /// Runs one command and sends what it produced. A broken input stream ends the session.
    fn dispatch(&mut self, script: &str) -> Result<Dispatch, SessionEnd> {
        let (outcome, replies, diagnostics, input_failure) = {
            let mut ctx = CommandContext::new(&mut self.scene, &mut self.reader);
            let outcome = command::execute(&mut self.interp, script, &mut ctx, &mut self.state);
            (outcome, ctx.replies, ctx.diagnostics, ctx.input_failure)
        };

        for reply in replies {
            self.responses.send(reply).map_err(SessionEnd::WriteFailed)?;
        }
        if let Some(err) = input_failure {
            error!(
                "command #{} lost the input stream: {}",
                self.state.command_count(),
                err
            );
            return Err(SessionEnd::ReadFailed(err));
        }
        if let Dispatch::Failed(err) = &outcome {
            warn!(
                "command #{} failed at {:.3}s: {}",
                self.state.command_count(),
                self.state.elapsed().as_secs_f64(),
                err
            );
            let mut text = format!("ERROR: {}\n", err);
            for note in diagnostics {
                text.push_str(&note);
                text.push('\n');
            }
            let response = Response::error(text).with_token(self.state.command_count());
            self.responses
                .send(response)
                .map_err(SessionEnd::WriteFailed)?;
        }
        Ok(outcome)
    }

    fn render(&mut self, batch: Batch) -> State {
        if batch.executed + batch.failed == 0 {
            return State::Await;
        }
        self.state.record_batch();
        if batch.executed == 0 && !self.render_idle {
            debug!("skipping the frame for {} failed commands", batch.failed);
            return State::Await;
        }

        self.scene.prepare_frame();
        let response = match self.renderer.render(&self.scene) {
            Ok(Some(frame)) => {
                self.state.record_frame();
                debug!(
                    "frame #{} {}x{} after {} commands",
                    self.state.frame_count(),
                    frame.width,
                    frame.height,
                    batch.executed
                );
                Response::image(frame.data)
            }
            Ok(None) => {
                debug!("nothing changed, acknowledging instead of a frame");
                Response::ack(self.state.command_count())
            }
            Err(err) => {
                warn!("render failed: {:#}", err);
                Response::error(format!("ERROR: render failed: {:#}\n", err))
                    .with_token(self.state.command_count())
            }
        };
        match self.responses.send(response) {
            Ok(()) => State::Await,
            Err(err) => State::Terminate(SessionEnd::WriteFailed(err)),
        }
    }

    fn end_of_file(&mut self) -> SessionEnd {
        let pending = self.pending.len() + self.reader.buffered();
        self.pending.clear();
        if pending > 0 {
            SessionEnd::Protocol(ProtocolError::Truncated { pending })
        } else {
            SessionEnd::EndOfFile
        }
    }
}

/// Starts a session with the built-in command set and renderer.
pub fn start<S, W>(
    config: &Config,
    source: S,
    out: W,
) -> Result<Server<S, Shell, FlatRenderer>, ChannelError>
where
    S: ByteSource,
    W: Write + Send + 'static,
{
    info!(
        "session started: line buffer {} bytes, command limit {} bytes, payload limit {} bytes, {:?} responses",
        config.line_buffer, config.max_command, config.max_payload, config.response_mode
    );
    let responses = response::open(config.response_mode, out)?;
    Ok(Server::new(
        config,
        source,
        Shell::default(),
        FlatRenderer::new(),
        responses,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::scripted::ScriptedSource;
    use crate::render::Frame;
    use crate::response::{ResponseKind, Strategy};
    use std::cell::{Cell, RefCell};
    use std::io::Read;
    use std::rc::Rc;

    type Sent = Rc<RefCell<Vec<(ResponseKind, Vec<u8>)>>>;

    struct RecordingSink(Sent, Rc<RefCell<Vec<Option<u64>>>>);

    impl ResponseSink for RecordingSink {
        fn send(&mut self, response: Response<'_>) -> Result<(), ChannelError> {
            self.0
                .borrow_mut()
                .push((response.kind(), response.bytes().to_vec()));
            self.1.borrow_mut().push(response.token());
            Ok(())
        }
    }

    /// Always produces a frame, so every render shows up in the responses.
    struct CountingRenderer(Rc<Cell<usize>>);

    impl Renderer for CountingRenderer {
        fn render(&mut self, scene: &Scene) -> anyhow::Result<Option<Frame>> {
            self.0.set(self.0.get() + 1);
            Ok(Some(Frame {
                width: 1,
                height: 1,
                data: scene.revision().to_string().into_bytes(),
            }))
        }
    }

    struct Session {
        end: SessionEnd,
        server: Server<ScriptedSource, Shell, CountingRenderer>,
        renders: usize,
        sent: Vec<(ResponseKind, Vec<u8>)>,
        tokens: Vec<Option<u64>>,
    }

    fn run_with(source: ScriptedSource, config: Config) -> Session {
        let sent = Sent::default();
        let tokens = Rc::new(RefCell::new(Vec::new()));
        let renders = Rc::new(Cell::new(0));
        let mut server = Server::new(
            &config,
            source,
            Shell::default(),
            CountingRenderer(Rc::clone(&renders)),
            Box::new(RecordingSink(Rc::clone(&sent), Rc::clone(&tokens))),
        );
        let end = server.run();
        let mut sent = sent.borrow().clone();
        assert_eq!(sent.remove(0).0, ResponseKind::Greeting);
        let mut tokens = tokens.borrow().clone();
        tokens.remove(0);
        Session {
            end,
            server,
            renders: renders.get(),
            sent,
            tokens,
        }
    }

    fn run(source: ScriptedSource) -> Session {
        run_with(source, Config::default())
    }

    fn kinds(session: &Session) -> Vec<ResponseKind> {
        session.sent.iter().map(|(kind, _)| *kind).collect()
    }

    #[test]
    fn burst_renders_once() {
        let session = run(ScriptedSource::new()
            .data("camera zoom 2\ncamera zoom 3\ncamera angle 10 20 0\n")
            .pause());
        assert!(session.end.is_clean());
        assert_eq!(session.renders, 1);
        assert_eq!(session.server.stats().commands, 3);
        assert_eq!(session.server.stats().batches, 1);
    }

    #[test]
    fn chunking_does_not_change_the_outcome() {
        let burst = b"camera zoom 2\ncamera angle 0 30 0\ncamera pan 0.1 0\ncamera zoom 3\n";
        let whole = run(ScriptedSource::new().data(&burst[..]).pause());
        for chunk in [1, 3, 7, 20].iter() {
            let session = run(ScriptedSource::new().chunked(burst, *chunk).pause());
            assert!(session.end.is_clean());
            assert_eq!(session.server.stats().commands, 4);
            assert_eq!(session.renders, 1, "chunks of {}", chunk);
            assert_eq!(session.server.stats().batches, 1);
            let camera = session.server.scene().camera();
            let expected = whole.server.scene().camera();
            assert!((camera.position() - expected.position()).length() < 1e-9);
            assert_eq!(camera.clipping_range(), expected.clipping_range());
        }
    }

    #[test]
    fn pieces_of_a_burst_render_once() {
        let session = run(ScriptedSource::new()
            .data("camera zo")
            .data("om 2\ncamera ")
            .data("zoom 3\n")
            .data("echo {a\n")
            .data("b}\n")
            .pause());
        assert!(session.end.is_clean());
        assert_eq!(session.server.stats().commands, 3);
        assert_eq!(kinds(&session), vec![ResponseKind::Data, ResponseKind::Image]);
        assert_eq!(session.renders, 1);
    }

    #[test]
    fn flush_renders_before_the_rest_of_the_input() {
        let session = run(ScriptedSource::new()
            .data("camera zoom 2\nimgflush\ncamera zoom 3\n")
            .pause());
        assert!(session.end.is_clean());
        assert_eq!(session.renders, 2);
        assert_eq!(session.server.stats().batches, 2);
    }

    #[test]
    fn pauses_separate_batches() {
        let session = run(ScriptedSource::new()
            .data("camera zoom 2\n")
            .pause()
            .data("camera zoom 3\n")
            .pause());
        assert_eq!(session.renders, 2);
    }

    #[test]
    fn failed_command_is_reported_and_session_goes_on() {
        let session = run(ScriptedSource::new()
            .data("camera zoom 0\necho still here\n")
            .pause());
        assert!(session.end.is_clean());
        assert_eq!(
            kinds(&session),
            vec![ResponseKind::Error, ResponseKind::Data, ResponseKind::Image]
        );
        let error = String::from_utf8(session.sent[0].1.clone()).unwrap();
        assert_eq!(session.tokens[0], Some(1));
        assert!(error.starts_with("ERROR: bad zoom factor \"0\""), "{}", error);
        assert!(error.contains("while executing \"camera zoom 0\""));
        assert_eq!(session.sent[1].1, b"still here");
        assert_eq!(session.server.stats().failed_commands, 1);
    }

    #[test]
    fn batch_of_failures_renders_only_when_asked_to() {
        let source = || ScriptedSource::new().data("nope\n").pause();
        let session = run(source());
        assert_eq!(session.renders, 0);
        assert_eq!(kinds(&session), vec![ResponseKind::Error]);

        let config = Config {
            render_idle: true,
            ..Config::default()
        };
        let session = run_with(source(), config);
        assert_eq!(session.renders, 1);
    }

    #[test]
    fn eof_inside_a_command_is_fatal() {
        let session = run(ScriptedSource::new().data("camera aim {1\n"));
        match session.end {
            SessionEnd::Protocol(ProtocolError::Truncated { pending: 14 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.renders, 0);
    }

    #[test]
    fn eof_inside_a_line_is_fatal() {
        let session = run(ScriptedSource::new().data("imgfl"));
        match session.end {
            SessionEnd::Protocol(ProtocolError::Truncated { pending: 5 }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn oversized_command_is_fatal() {
        let config = Config {
            max_command: 16,
            ..Config::default()
        };
        let session = run_with(
            ScriptedSource::new().data("echo {aaaaaaaaaa\nbbbbbbbbbb}\n"),
            config,
        );
        match session.end {
            SessionEnd::Protocol(ProtocolError::CommandTooLong { limit: 16 }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn read_failure_is_fatal() {
        let session = run(ScriptedSource::new()
            .data("camera zoom 2\n")
            .pause()
            .fail(std::io::ErrorKind::ConnectionReset));
        assert!(!session.end.is_clean());
        match session.end {
            SessionEnd::ReadFailed(FrameError::Io(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.renders, 1);
    }

    #[test]
    fn braces_join_lines_across_reads() {
        let session = run(ScriptedSource::new()
            .data("echo {a\n")
            .pause()
            .data("b}\n")
            .pause());
        assert!(session.end.is_clean());
        assert_eq!(session.sent[0], (ResponseKind::Data, b"a\nb".to_vec()));
        assert_eq!(session.renders, 1);
    }

    #[test]
    fn raw_payload_follows_its_command() {
        let session = run(ScriptedSource::new()
            .data("data follows 5\nHEL")
            .pause()
            .data("LOecho done\n")
            .pause());
        assert!(session.end.is_clean());
        assert_eq!(session.server.scene().last_payload(), Some(&b"HELLO"[..]));
        assert_eq!(session.sent[0], (ResponseKind::Data, b"done".to_vec()));
    }

    #[test]
    fn eof_inside_a_payload_is_fatal() {
        let session = run(ScriptedSource::new().data("data follows 10\n12345"));
        match session.end {
            SessionEnd::ReadFailed(FrameError::Truncated {
                expected: 10,
                got: 5,
            }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.sent.is_empty());
        assert_eq!(session.renders, 0);
    }

    #[test]
    fn read_failure_inside_a_payload_is_fatal() {
        let session = run(ScriptedSource::new()
            .data("data follows 10\n123")
            .fail(std::io::ErrorKind::ConnectionReset)
            .data("4567890echo late\n"));
        match session.end {
            SessionEnd::ReadFailed(FrameError::Io(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.sent.is_empty());
    }

    #[test]
    fn oversized_payload_is_refused() {
        let config = Config {
            max_payload: 1024,
            ..Config::default()
        };
        let session = run_with(
            ScriptedSource::new()
                .data("data follows 9223372036854775807\necho ok\n")
                .pause(),
            config,
        );
        assert!(session.end.is_clean());
        assert_eq!(
            kinds(&session),
            vec![ResponseKind::Error, ResponseKind::Data, ResponseKind::Image]
        );
        let error = String::from_utf8(session.sent[0].1.clone()).unwrap();
        assert!(error.contains("exceeds the limit of 1024 bytes"), "{}", error);
        assert_eq!(session.sent[1].1, b"ok");
        assert_eq!(session.server.scene().last_payload(), None);
    }

    #[test]
    fn unchanged_scene_is_acknowledged() {
        let sent = Sent::default();
        let tokens = Rc::new(RefCell::new(Vec::new()));
        let mut server = Server::new(
            &Config::default(),
            ScriptedSource::new()
                .data("imgflush\n")
                .pause()
                .data("imgflush\n")
                .pause(),
            Shell::default(),
            FlatRenderer::new(),
            Box::new(RecordingSink(Rc::clone(&sent), Rc::clone(&tokens))),
        );
        assert!(server.run().is_clean());
        let kinds: Vec<_> = sent.borrow().iter().map(|(kind, _)| *kind).collect();
        assert_eq!(
            kinds,
            vec![ResponseKind::Greeting, ResponseKind::Image, ResponseKind::Ok]
        );
        assert_eq!(*tokens.borrow(), vec![None, None, Some(2)]);
        assert_eq!(server.stats().frames, 1);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let session = run(ScriptedSource::new().data("\n\n  \n").pause());
        assert!(session.end.is_clean());
        assert_eq!(session.server.stats().commands, 0);
        assert_eq!(session.renders, 0);
    }

    #[test]
    fn socket_session() {
        use crate::framer::FdSource;
        use std::io::Write;
        use std::net::Shutdown;
        use std::os::unix::net::UnixStream;
        use std::thread;

        let (mut client, server) = UnixStream::pair().unwrap();
        let out = server.try_clone().unwrap();
        let handle = thread::spawn(move || {
            let config = Config {
                response_mode: Strategy::Queued,
                ..Config::default()
            };
            let mut session = start(&config, FdSource::new(server).unwrap(), out).unwrap();
            let end = session.run();
            (end.is_clean(), session.stats())
        });

        client
            .write_all(b"screen 2 2\nscreen bgcolor 1 0 0\nimgflush\n")
            .unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();

        let (clean, stats) = handle.join().unwrap();
        assert!(clean);
        assert_eq!(stats.frames, 1);

        let mut expected = format!("vizserver {}\n", env!("CARGO_PKG_VERSION")).into_bytes();
        expected.extend_from_slice(b"nv>image -type image -bytes 23\nP6\n2 2\n255\n");
        for _ in 0..4 {
            expected.extend_from_slice(&[255, 0, 0]);
        }
        assert_eq!(received, expected);
    }
}
