use log::warn;
use std::env;
use std::str::FromStr;
use vizserver_service::{Config, Strategy};

pub struct Settings {
    pub service: Config,
    /// Where to write the JSON session summary, if anywhere.
    pub stats_file: Option<String>,
}

/// Reads and parses the variable. A malformed value is reported and treated as absent.
fn parsed<T: FromStr>(name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let text = env::var(name).ok()?;
    match text.trim().parse() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("ignoring {}={:?}: {}", name, text, err);
            None
        }
    }
}

fn line_buffer() -> Option<usize> {
    parsed("VIZ_LINE_BUFFER")
}

fn max_command() -> Option<usize> {
    parsed("VIZ_MAX_COMMAND")
}

fn max_payload() -> Option<usize> {
    parsed("VIZ_MAX_PAYLOAD")
}

fn response_mode() -> Option<Strategy> {
    parsed("VIZ_RESPONSE_MODE")
}

fn parse_screen(text: &str) -> Option<(u32, u32)> {
    let mut parts = text.trim().splitn(2, |c| c == 'x' || c == 'X');
    let width = parts.next()?.parse().ok()?;
    let height = parts.next()?.parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

fn screen() -> Option<(u32, u32)> {
    let text = env::var("VIZ_SCREEN").ok()?;
    let screen = parse_screen(&text);
    if screen.is_none() {
        warn!("ignoring VIZ_SCREEN={:?}: expected WIDTHxHEIGHT", text);
    }
    screen
}

fn stats_file() -> Option<String> {
    env::var("VIZ_STATS_FILE").ok().filter(|path| !path.is_empty())
}

fn is_positive_answer(var_text: &str) -> bool {
    match var_text {
        "0" | "false" | "no" | "n" => false,
        _ => true,
    }
}

fn render_idle() -> Option<bool> {
    let mut render_idle_var = env::var("VIZ_RENDER_IDLE").ok()?;
    render_idle_var.make_ascii_lowercase();
    Some(is_positive_answer(&render_idle_var))
}

/// Read the config file.
pub fn obtain() -> Settings {
    // First, make sure that we've loaded configuration from the .env file.
    let _ = dotenv::dotenv();

    // Read the config or use the defaults.
    let defaults = Config::default();
    Settings {
        service: Config {
            line_buffer: line_buffer().unwrap_or(defaults.line_buffer),
            max_command: max_command().unwrap_or(defaults.max_command),
            max_payload: max_payload().unwrap_or(defaults.max_payload),
            response_mode: response_mode().unwrap_or(defaults.response_mode),
            screen: screen().unwrap_or(defaults.screen),
            render_idle: render_idle().unwrap_or(defaults.render_idle),
        },
        stats_file: stats_file(),
    }
}
