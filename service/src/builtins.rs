//! The commands a client can send.
//!
//! ```text
//! camera aim <x> <y> <z>
//! camera angle <xAngle> <yAngle> <zAngle>
//! camera zoom <factor>
//! camera pan <dx> <dy>
//! camera reset ?all?
//! screen <width> <height>
//! screen bgcolor <r> <g> <b>
//! bounds <xmin> <ymin> <zmin> <xmax> <ymax> <zmax>
//! bounds clear
//! data follows <nbytes>
//! imgflush
//! echo ?word ...?
//! ```

use crate::clip::Bounds;
use crate::framer::FrameError;
use crate::interp::{CommandContext, CommandError, Flow, Shell};
use crate::response::Response;
use glam::DVec3;
use log::debug;

type CmdResult = Result<Flow, CommandError>;

pub fn register(shell: &mut Shell) {
    shell.register("camera", camera);
    shell.register("screen", screen);
    shell.register("bounds", bounds);
    shell.register("data", data);
    shell.register("imgflush", imgflush);
    shell.register("echo", echo);
}

fn wrong_args(args: &[String], usage: &str) -> CommandError {
    let prefix = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
    CommandError(format!("wrong # args: should be \"{} {}\"", prefix, usage))
}

fn get_double(arg: &str) -> Result<f64, CommandError> {
    arg.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CommandError(format!("expected floating-point number but got \"{}\"", arg)))
}

fn get_int(arg: &str) -> Result<i64, CommandError> {
    arg.parse::<i64>()
        .map_err(|_| CommandError(format!("expected integer but got \"{}\"", arg)))
}

fn get_vec3(args: &[String]) -> Result<DVec3, CommandError> {
    Ok(DVec3::new(
        get_double(&args[0])?,
        get_double(&args[1])?,
        get_double(&args[2])?,
    ))
}

fn bad_option(args: &[String], choices: &str) -> CommandError {
    let op = args.get(1).map(String::as_str).unwrap_or("");
    CommandError(format!(
        "bad option \"{}\": should be one of {}",
        op, choices
    ))
}

fn camera(ctx: &mut CommandContext<'_>, args: &[String]) -> CmdResult {
    const OPS: &str = "aim, angle, pan, reset, or zoom";
    match args.get(1).map(String::as_str) {
        Some("aim") => {
            if args.len() != 5 {
                return Err(wrong_args(args, "x y z"));
            }
            let focal = get_vec3(&args[2..])?;
            ctx.scene.update_camera(|cam| cam.aim(focal));
        }
        Some("angle") => {
            if args.len() != 5 {
                return Err(wrong_args(args, "xAngle yAngle zAngle"));
            }
            let angles = get_vec3(&args[2..])?;
            ctx.scene
                .update_camera(|cam| cam.orbit(angles.x, angles.y, angles.z));
        }
        Some("zoom") => {
            if args.len() != 3 {
                return Err(wrong_args(args, "factor"));
            }
            let factor = get_double(&args[2])?;
            if factor <= 0.0 {
                return Err(CommandError(format!(
                    "bad zoom factor \"{}\": should be greater than zero",
                    args[2]
                )));
            }
            ctx.scene.update_camera(|cam| cam.zoom(factor));
        }
        Some("pan") => {
            if args.len() != 4 {
                return Err(wrong_args(args, "x y"));
            }
            let dx = get_double(&args[2])?;
            let dy = get_double(&args[3])?;
            ctx.scene.update_camera(|cam| cam.pan(dx, dy));
        }
        Some("reset") => {
            let all = match args.get(2).map(String::as_str) {
                None => false,
                Some("all") if args.len() == 3 => true,
                _ => return Err(wrong_args(args, "?all?")),
            };
            let bounds = ctx.scene.bounds();
            ctx.scene.update_camera(|cam| cam.reset(&bounds, all));
        }
        _ => return Err(bad_option(args, OPS)),
    }
    Ok(Flow::Continue)
}

fn screen(ctx: &mut CommandContext<'_>, args: &[String]) -> CmdResult {
    if args.get(1).map(String::as_str) == Some("bgcolor") {
        if args.len() != 5 {
            return Err(wrong_args(args, "r g b"));
        }
        let rgb = get_vec3(&args[2..])?;
        let mut color = [0f32; 3];
        for (c, &v) in color.iter_mut().zip([rgb.x, rgb.y, rgb.z].iter()) {
            *c = v.max(0.0).min(1.0) as f32;
        }
        ctx.scene.set_background(color);
        return Ok(Flow::Continue);
    }

    if args.len() != 3 {
        return Err(CommandError(format!(
            "wrong # args: should be \"{} width height\"",
            args[0]
        )));
    }
    let width = get_int(&args[1])?;
    let height = get_int(&args[2])?;
    if width <= 0 || height <= 0 || width > 8192 || height > 8192 {
        return Err(CommandError(format!(
            "bad screen size {}x{}: should be between 1 and 8192",
            width, height
        )));
    }
    ctx.scene.resize(width as u32, height as u32);
    Ok(Flow::Continue)
}

fn bounds(ctx: &mut CommandContext<'_>, args: &[String]) -> CmdResult {
    if args.len() == 2 && args[1] == "clear" {
        ctx.scene.set_bounds(None);
        return Ok(Flow::Continue);
    }
    if args.len() != 7 {
        return Err(CommandError(format!(
            "wrong # args: should be \"{} xmin ymin zmin xmax ymax zmax\" or \"{} clear\"",
            args[0], args[0]
        )));
    }
    let min = get_vec3(&args[1..4])?;
    let max = get_vec3(&args[4..7])?;
    ctx.scene.set_bounds(Some(Bounds::new(min, max)));
    Ok(Flow::Continue)
}

fn data(ctx: &mut CommandContext<'_>, args: &[String]) -> CmdResult {
    if args.len() != 3 || args[1] != "follows" {
        return Err(CommandError(format!(
            "wrong # args: should be \"{} follows nbytes\"",
            args[0]
        )));
    }
    let nbytes = get_int(&args[2])?;
    if nbytes < 0 {
        return Err(CommandError(format!("bad byte count \"{}\"", args[2])));
    }
    let payload = match ctx.payload.following_data(nbytes as usize) {
        Ok(payload) => payload,
        // Refused before reading, the stream is intact.
        Err(err @ FrameError::PayloadTooLarge { .. }) => {
            return Err(CommandError(err.to_string()))
        }
        Err(err) => return Err(ctx.input_failed(err)),
    };
    debug!("received a payload of {} bytes", payload.len());
    ctx.scene.set_payload(payload);
    Ok(Flow::Continue)
}

fn imgflush(_ctx: &mut CommandContext<'_>, args: &[String]) -> CmdResult {
    if args.len() != 1 {
        return Err(CommandError(format!(
            "wrong # args: should be \"{}\"",
            args[0]
        )));
    }
    Ok(Flow::Break)
}

fn echo(ctx: &mut CommandContext<'_>, args: &[String]) -> CmdResult {
    let text = args[1..].join(" ");
    ctx.reply(Response::data(text.into_bytes()));
    Ok(Flow::Continue)
}
