use std::fmt;
use std::rc::Rc;

use mlua::{IntoLuaMulti, Result as LuaResult, Table, Value};

use crate::lua::{number, raise, ModuleBuilder, ScriptVm};

pub const GAME_MODULE: &str = "lab.system.game";
pub const LOG_MODULE: &str = "lab.system.log";

/// Engine capabilities the bridge and level scripts can invoke.
pub trait EngineCalls {
    fn add_score(&self, _player_id: i32, _score: f64) {}
    fn add_bot(&self, _name: &str, _skill: f64, _team: &str) {}
    fn execute_console_command(&self, _command: &str) {}
    /// Fraction of the segment travelled before hitting geometry.
    fn raycast(&self, _start: [f64; 3], _end: [f64; 3]) -> f64 {
        1.0
    }
    fn in_fov(&self, start: [f64; 3], end: [f64; 3], angles: [f64; 3], fov: f64) -> bool {
        in_fov(start, end, angles, fov)
    }
    fn episode_time_seconds(&self) -> f64 {
        0.0
    }
}

impl fmt::Debug for dyn EngineCalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EngineCalls")
    }
}

/// Whether `end` lies within `fov` degrees of the view from `start` along
/// `angles` (pitch, yaw, roll in degrees).
pub fn in_fov(start: [f64; 3], end: [f64; 3], angles: [f64; 3], fov: f64) -> bool {
    let delta = [end[0] - start[0], end[1] - start[1], end[2] - start[2]];
    let length = delta.iter().map(|c| c * c).sum::<f64>().sqrt();
    if length == 0.0 {
        return true;
    }
    let (pitch, yaw) = (angles[0].to_radians(), angles[1].to_radians());
    let forward = [pitch.cos() * yaw.cos(), pitch.cos() * yaw.sin(), -pitch.sin()];
    let cos_angle = forward
        .iter()
        .zip(delta.iter())
        .map(|(f, d)| f * d)
        .sum::<f64>()
        / length;
    cos_angle >= (fov.to_radians() / 2.0).cos()
}

/// Register `lab.system.game` over the engine calls.
pub fn install(vm: &ScriptVm, calls: Rc<dyn EngineCalls>, runfiles: String, temp_folder: String) {
    vm.add_native_module(GAME_MODULE, move |lua| {
        let module = ModuleBuilder::new(lua)?;

        let engine = calls.clone();
        module.function("addScore", move |lua, args| {
            let player_id = args.first().and_then(number);
            let score = args.get(1).and_then(number);
            let (Some(player_id), Some(score)) = (player_id, score) else {
                return Err(raise("[game.addScore] - Must be called with playerId and score"));
            };
            engine.add_score(player_id as i32, score);
            ().into_lua_multi(lua)
        })?;

        let engine = calls.clone();
        module.function("addBot", move |lua, args| {
            let Some(Value::Table(bot)) = args.first() else {
                return Err(raise("[game.addBot] - Must be called with {name, skill, team}"));
            };
            let name: String = field(bot, "addBot", "name")?;
            let skill: f64 = field(bot, "addBot", "skill")?;
            let team: String = field(bot, "addBot", "team")?;
            engine.add_bot(&name, skill, &team);
            ().into_lua_multi(lua)
        })?;

        let engine = calls.clone();
        module.function("console", move |lua, args| {
            let Some(Value::String(command)) = args.first() else {
                return Err(raise("[game.console] - Command must be a string"));
            };
            engine.execute_console_command(command.to_str()?);
            ().into_lua_multi(lua)
        })?;

        let engine = calls.clone();
        module.function("raycast", move |lua, args| {
            let start = vector(args.first(), "raycast", "start")?;
            let end = vector(args.get(1), "raycast", "end")?;
            engine.raycast(start, end).into_lua_multi(lua)
        })?;

        let engine = calls.clone();
        module.function("inFov", move |lua, args| {
            let start = vector(args.first(), "inFov", "start")?;
            let end = vector(args.get(1), "inFov", "end")?;
            let angles = vector(args.get(2), "inFov", "angles")?;
            let fov = args
                .get(3)
                .and_then(number)
                .ok_or_else(|| raise("[game.inFov] - 'fov' must be a number"))?;
            engine.in_fov(start, end, angles, fov).into_lua_multi(lua)
        })?;

        let engine = calls.clone();
        module.function("episodeTimeSeconds", move |lua, _| {
            engine.episode_time_seconds().into_lua_multi(lua)
        })?;

        let temp_folder = temp_folder.clone();
        module.function("tempFolder", move |lua, _| temp_folder.as_str().into_lua_multi(lua))?;
        let runfiles = runfiles.clone();
        module.function("runFiles", move |lua, _| runfiles.as_str().into_lua_multi(lua))?;

        Ok(module.finish())
    });
}

/// Register `lab.system.log`, routing script messages into the `log` facade.
pub fn install_log(vm: &ScriptVm) {
    vm.add_native_module(LOG_MODULE, move |lua| {
        let module = ModuleBuilder::new(lua)?;
        for (name, level) in [
            ("info", log::Level::Info),
            ("warn", log::Level::Warn),
            ("error", log::Level::Error),
        ] {
            module.function(name, move |lua, args| {
                let parts = args
                    .iter()
                    .map(|value| match value {
                        Value::String(text) => text.to_str().map(str::to_string),
                        other => Ok(describe(other)),
                    })
                    .collect::<LuaResult<Vec<_>>>()?;
                log::log!(target: "lab_bridge::script", level, "{}", parts.join(" "));
                ().into_lua_multi(lua)
            })?;
        }
        Ok(module.finish())
    });
}

fn describe(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(flag) => flag.to_string(),
        Value::Integer(n) => n.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.type_name().to_string(),
    }
}

fn field<'lua, T: mlua::FromLua<'lua>>(table: &Table<'lua>, api: &str, key: &str) -> LuaResult<T> {
    table
        .get::<_, Option<T>>(key)
        .ok()
        .flatten()
        .ok_or_else(|| raise(format!("[game.{api}] - Missing or invalid '{key}'")))
}

fn vector(value: Option<&Value>, api: &str, name: &str) -> LuaResult<[f64; 3]> {
    let invalid = || raise(format!("[game.{api}] - '{name}' must be an array of 3 numbers"));
    let Some(Value::Table(table)) = value else {
        return Err(invalid());
    };
    let mut out = [0.0; 3];
    for (index, slot) in out.iter_mut().enumerate() {
        let component: Value = table.raw_get(index + 1)?;
        *slot = number(&component).ok_or_else(invalid)?;
    }
    Ok(out)
}
