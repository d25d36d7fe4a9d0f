use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context as _, Result};
use lab_bridge::{
    Context, ContextOptions, EngineCalls, EngineHooks, Entity, HostFileSystem,
    ObservationPayload, STATUS_ERROR, STATUS_OK,
};
use lab_wire::{EntityInstance, EventPayload, ObservationType, SpawnVarsBuffer};
use tempfile::TempDir;

const LEVEL: &str = r#"
local tensor = require 'lab.system.tensor'
local events = require 'lab.system.events'
local game = require 'lab.system.game'
local random = require 'lab.system.random'
local entities = require 'lab.system.game_entities'
local spawn = require 'lab.system.pickups_spawn'
local helper = require 'helper'

local api = { fired = 0 }

function api:init(settings)
  self.reward = tonumber(settings.reward or '1')
end

function api:start(episode, seed)
  self.episode = episode
  self.fired = 0
  spawn.spawn{ classname = 'apple', origin = helper.origin() }
end

function api:customDiscreteActionSpec()
  return { { name = 'FIRE', min = 0, max = 1 } }
end

function api:customDiscreteActions(values)
  if values[1] == 1 then
    self.fired = self.fired + 1
    game:addScore(0, self.reward)
    events:add('fired', tensor.DoubleTensor{ self.fired })
  end
end

function api:customObservationSpec()
  return {
    { name = 'SCORES', type = 'Doubles', shape = { 3 } },
    { name = 'LABEL', type = 'String', shape = { 0 } },
    { name = 'VISIBLE', type = 'Bytes', shape = { 0 } },
  }
end

function api:customObservation(name)
  if name == 'SCORES' then
    return tensor.DoubleTensor{ 10, 20, 30 }
  elseif name == 'LABEL' then
    return 'episode ' .. self.episode
  else
    local visible = {}
    for _, e in ipairs(entities.entities()) do
      visible[#visible + 1] = e.visible and 1 or 0
    end
    return tensor.ByteTensor(visible)
  end
end

function api:createPickup(class)
  if class == 'apple' then
    return { name = 'Apple', classname = 'apple', model = 'models/apple.md3',
             quantity = 1, type = 2 }
  end
end

function api:pickup(entityId, playerId)
  return random.uniformInt(5, 5)
end

function api:hasEpisodeFinished(seconds)
  return self.fired >= 3
end

return api
"#;

#[derive(Default)]
struct RecordingEngine {
    scores: RefCell<Vec<(i32, f64)>>,
}

impl EngineCalls for RecordingEngine {
    fn add_score(&self, player_id: i32, score: f64) {
        self.scores.borrow_mut().push((player_id, score));
    }
}

fn write_level(dir: &Path) -> Result<()> {
    fs::write(dir.join("lifecycle.lua"), LEVEL).context("writing level")?;
    fs::write(
        dir.join("helper.lua"),
        "return { origin = function() return '1 2 3' end }",
    )
    .context("writing helper")?;
    Ok(())
}

fn context_for(dir: &Path, engine: Rc<RecordingEngine>) -> Result<Context> {
    let options = ContextOptions {
        runfiles_dir: dir.to_path_buf(),
        temp_folder: dir.to_path_buf(),
    };
    let mut context = Context::new(engine, Rc::new(HostFileSystem), options)?;
    context.add_setting("levelDirectory", &dir.display().to_string())?;
    context.add_setting("reward", "2.5")?;
    context.set_level_name("lifecycle");
    Ok(context)
}

#[test]
fn full_episode_through_the_context() -> Result<()> {
    let dir = TempDir::new()?;
    write_level(dir.path())?;
    let engine = Rc::new(RecordingEngine::default());
    let mut context = context_for(dir.path(), engine.clone())?;

    context.init()?;
    assert_eq!(context.actions().name(0), Some("FIRE"));
    assert_eq!(context.observations().count(), 3);

    context.entities_mut().add(Entity {
        entity_id: 0,
        user_id: 0,
        kind: 1,
        flags: 0,
        position: [0.0; 3],
        class_name: "apple".to_string(),
    });
    context.entities_mut().add(Entity {
        entity_id: 1,
        user_id: 0,
        kind: 1,
        flags: lab_wire::ENTITY_FLAG_NODRAW,
        position: [0.0; 3],
        class_name: "apple".to_string(),
    });

    context.start(4, 123)?;
    assert_eq!(context.pickups().dynamic_spawn_entity_count(), 1);
    let spawned = context
        .pickups()
        .dynamic_spawn_entity(0)
        .context("spawned entity")?;
    assert_eq!(spawned.get("origin").map(String::as_str), Some("1 2 3"));

    for _ in 0..3 {
        assert!(!context.has_episode_finished(0.0)?);
        context.apply_actions(&[1])?;
    }
    assert!(context.has_episode_finished(0.0)?);
    assert_eq!(*engine.scores.borrow(), vec![(0, 2.5); 3]);

    {
        let events = context.events();
        assert_eq!(events.count(), 3);
        let last = events.export(2);
        assert_eq!(events.type_name(last.type_id), Some("fired"));
        assert_eq!(last.observations[0].payload, EventPayload::Doubles(&[3.0]));
    }

    {
        let scores = context.observation(0)?;
        assert_eq!(scores.spec.kind, ObservationType::Doubles);
        assert_eq!(scores.spec.shape, &[3]);
        match &scores.payload {
            ObservationPayload::Doubles(values) => assert_eq!(&values[..], &[10.0, 20.0, 30.0]),
            other => panic!("unexpected payload {other:?}"),
        }
    }
    {
        let label = context.observation(1)?;
        match &label.payload {
            ObservationPayload::String(text) => assert_eq!(*text, "episode 4"),
            other => panic!("unexpected payload {other:?}"),
        }
    }
    {
        let visible = context.observation(2)?;
        match &visible.payload {
            ObservationPayload::Bytes(values) => assert_eq!(&values[..], &[1, 0]),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    let apple = context.find_item("apple")?.context("apple is a pickup")?;
    assert_eq!(context.pickups().item(apple).map(|item| item.quantity), Some(1));
    assert_eq!(context.override_pickup(0, 0)?, Some(5));
    assert!(context.can_pickup(0, 0)?);

    context.start(5, 123)?;
    assert_eq!(context.events().count(), 0);
    assert_eq!(context.events().type_id("fired"), Some(0));
    assert_eq!(context.pickups().dynamic_spawn_entity_count(), 1);
    assert_eq!(context.vm().depth(), 0);
    Ok(())
}

#[test]
fn hooks_report_contract_violations() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(
        dir.path().join("no_applier.lua"),
        r#"
        return {
          customDiscreteActionSpec = function() return { { name = 'FIRE', min = 0, max = 1 } } end,
        }
        "#,
    )?;
    let mut context = Context::new(
        Rc::new(RecordingEngine::default()),
        Rc::new(HostFileSystem),
        ContextOptions::default(),
    )?;
    let hooks: &mut dyn EngineHooks = &mut context;
    hooks.set_level_name(&dir.path().join("no_applier.lua").display().to_string());
    assert_eq!(hooks.init(), STATUS_OK, "{}", hooks.error_message());
    assert_eq!(hooks.start(0, 1), STATUS_OK);
    assert_eq!(hooks.custom_action_discrete_count(), 1);
    assert_eq!(hooks.custom_action_discrete_bounds(0), (0, 1));
    assert_eq!(hooks.custom_action_discrete_apply(&[1]), STATUS_ERROR);
    assert_eq!(
        hooks.error_message(),
        "[customDiscreteActions] - level declares custom actions but does not define 'customDiscreteActions'"
    );

    let mut index = None;
    assert_eq!(hooks.find_item("apple", &mut index), STATUS_OK);
    assert_eq!(index, None);
    Ok(())
}

#[test]
fn spawn_vars_cross_the_hook_boundary() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(
        dir.path().join("spawn.lua"),
        r#"
        local api = {}
        function api:updateSpawnVars(vars)
          if vars.classname == 'apple' then
            vars.classname = 'lemon'
            return vars
          end
        end
        function api:extraEntities()
          return { { classname = 'info_player_start', angle = '90' } }
        end
        return api
        "#,
    )?;
    let mut context = Context::new(
        Rc::new(RecordingEngine::default()),
        Rc::new(HostFileSystem),
        ContextOptions::default(),
    )?;
    let hooks: &mut dyn EngineHooks = &mut context;
    hooks.set_level_name(&dir.path().join("spawn.lua").display().to_string());
    assert_eq!(hooks.init(), STATUS_OK, "{}", hooks.error_message());

    let apple: EntityInstance = [
        ("classname".to_string(), "apple".to_string()),
        ("origin".to_string(), "0 0 0".to_string()),
    ]
    .into();
    let mut buffer = SpawnVarsBuffer::encode(&apple)?;
    assert_eq!(hooks.update_spawn_vars(&mut buffer), STATUS_OK);
    let updated = buffer.decode()?;
    assert_eq!(updated.get("classname").map(String::as_str), Some("lemon"));
    assert_eq!(updated.get("origin").map(String::as_str), Some("0 0 0"));

    let mut count = 0;
    assert_eq!(hooks.make_extra_entities(&mut count), STATUS_OK);
    assert_eq!(count, 1);
    let extra = hooks.read_extra_entity(0).context("extra entity")?.decode()?;
    assert_eq!(extra.get("angle").map(String::as_str), Some("90"));
    assert!(hooks.read_extra_entity(1).is_none());
    Ok(())
}
