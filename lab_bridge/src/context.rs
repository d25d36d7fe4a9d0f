//! The per-environment bridge: one script VM, the level object it loaded and
//! the protocol registries built from it.

mod actions;
mod entities;
mod events;
mod game;
mod level;
mod observations;
mod pickups;
mod random;
mod settings;

pub use actions::{ActionSpec, ActionsRegistry};
pub use entities::{EntitiesRegistry, Entity, GAME_ENTITIES_MODULE};
pub use events::{EventsRegistry, EVENTS_MODULE};
pub use game::{in_fov, EngineCalls, GAME_MODULE, LOG_MODULE};
pub use observations::{Observation, ObservationEntry, ObservationPayload, ObservationsRegistry};
pub use pickups::{MoveType, PickupItem, PickupsRegistry, PICKUPS_SPAWN_MODULE};
pub use random::{mix_seed, Prbg, RANDOM_MODULE};
pub use settings::{Settings, LEVEL_DIRECTORY_KEY, MIXER_SEED_KEY};

use std::cell::{Ref, RefCell, RefMut};
use std::path::PathBuf;
use std::rc::Rc;

use lab_wire::{EntityInstance, SpawnVarsBuffer};
use mlua::Value;

use crate::error::{BridgeError, Result};
use crate::file_system::FileSystem;
use crate::lua::{ReadResult, ReadValue, ResultOrError, ScriptVm, StackScope, ValueHandle};
use crate::tensor;

use level::call_level;

const INIT_API: &str = "init";
const START_API: &str = "start";
const COMMAND_LINE_API: &str = "commandLine";
const NEXT_MAP_API: &str = "nextMap";
const EPISODE_FINISHED_API: &str = "hasEpisodeFinished";

/// Host paths exposed to level scripts.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub runfiles_dir: PathBuf,
    pub temp_folder: PathBuf,
}

/// Owns everything one environment instance needs on the script side.
///
/// Field order matters: registries hold value handles into the VM, so the VM
/// is declared last and dropped after them.
#[derive(Debug)]
pub struct Context {
    calls: Rc<dyn EngineCalls>,
    file_system: Rc<dyn FileSystem>,
    options: ContextOptions,
    settings: Settings,
    level_name: String,
    level: ValueHandle,
    actions: ActionsRegistry,
    observations: ObservationsRegistry,
    pickups: PickupsRegistry,
    events: Rc<RefCell<EventsRegistry>>,
    entities: Rc<RefCell<EntitiesRegistry>>,
    random: Rc<RefCell<Prbg>>,
    error_message: String,
    vm: ScriptVm,
}

impl Context {
    /// Create a context with every `lab.system.*` module registered.
    pub fn new(
        calls: Rc<dyn EngineCalls>,
        file_system: Rc<dyn FileSystem>,
        options: ContextOptions,
    ) -> Result<Self> {
        let vm = ScriptVm::new()?;
        let pickups = PickupsRegistry::default();
        let events = Rc::new(RefCell::new(EventsRegistry::default()));
        let entities = Rc::new(RefCell::new(EntitiesRegistry::default()));
        let random = Rc::new(RefCell::new(Prbg::default()));

        tensor::install(&vm);
        events::install(&vm, events.clone());
        entities::install(&vm, entities.clone());
        random::install(&vm, random.clone());
        pickups::install(&vm, pickups.spawn_queue());
        game::install(
            &vm,
            calls.clone(),
            options.runfiles_dir.display().to_string(),
            options.temp_folder.display().to_string(),
        );
        game::install_log(&vm);

        Ok(Self {
            calls,
            file_system,
            options,
            settings: Settings::default(),
            level_name: String::new(),
            level: ValueHandle::unbound(),
            actions: ActionsRegistry::default(),
            observations: ObservationsRegistry::default(),
            pickups,
            events,
            entities,
            random,
            error_message: String::new(),
            vm,
        })
    }

    pub fn vm(&self) -> &ScriptVm {
        &self.vm
    }

    pub fn calls(&self) -> &Rc<dyn EngineCalls> {
        &self.calls
    }

    pub fn set_level_name(&mut self, name: impl Into<String>) {
        self.level_name = name.into();
    }

    pub fn level_name(&self) -> &str {
        &self.level_name
    }

    pub fn add_setting(&mut self, key: &str, value: &str) -> Result<()> {
        self.settings.apply(key, value)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn replace_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    /// Where the level script is read from: the level name itself when it
    /// names a `.lua` file, otherwise `<name>.lua` in the level directory.
    pub fn level_path(&self) -> PathBuf {
        if self.level_name.ends_with(".lua") {
            return PathBuf::from(&self.level_name);
        }
        let directory = self.settings.level_directory.clone().unwrap_or_else(|| {
            self.options.runfiles_dir.join("game_scripts").join("levels")
        });
        directory.join(format!("{}.lua", self.level_name))
    }

    /// Load the level script, run its `init(settings)` and read the custom
    /// action and observation specs.
    pub fn init(&mut self) -> Result<()> {
        let path = self.level_path();
        log::debug!("loading level script {}", path.display());
        let source = self
            .file_system
            .read_file(&path)
            .map_err(|source| BridgeError::LevelNotFound {
                path: path.clone(),
                source,
            })?;
        if let Some(directory) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            self.vm.add_path_to_search_list(directory)?;
        }

        let level = {
            let _scope = StackScope::new(&self.vm);
            let count = match self.vm.load_chunk(&path.display().to_string(), &source) {
                ResultOrError::Count(count) => count,
                ResultOrError::Error(message) => {
                    return Err(BridgeError::script(self.level_name.as_str(), message))
                }
            };
            match ValueHandle::read_value(self.vm.lua(), self.vm.result(count, 0)?) {
                ReadResult::Found(level) if level.is_table(&self.vm) => level,
                _ => {
                    return Err(BridgeError::contract(
                        self.level_name.as_str(),
                        "level script must return a table",
                    ))
                }
            }
        };
        let previous = std::mem::replace(&mut self.level, level);
        previous.release(&self.vm);

        self.call_init()?;
        self.actions.read_spec(&self.vm, &self.level)?;
        self.observations.read_spec(&self.vm, &self.level)?;
        log::debug!(
            "level {} declares {} actions and {} observations",
            self.level_name,
            self.actions.count(),
            self.observations.count()
        );
        Ok(())
    }

    fn call_init(&self) -> Result<()> {
        let _scope = StackScope::new(&self.vm);
        let settings = self.vm.lua().create_table_from(
            self.settings
                .level
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str())),
        )?;
        let Some(count) = call_level(&self.vm, &self.level, INIT_API, settings)? else {
            return Ok(());
        };
        match self.vm.result(count, 0)? {
            Value::Boolean(false) => Err(BridgeError::contract(INIT_API, "level init returned false")),
            _ => Ok(()),
        }
    }

    /// Begin an episode: reseed the generator, drop per-episode state and
    /// call the level's `start(episode, seed)`.
    pub fn start(&mut self, episode: i32, seed: i32) -> Result<()> {
        let mixed = mix_seed(seed, self.settings.mixer_seed);
        log::debug!("starting episode {episode} with seed {seed} (mixed {mixed:#x})");
        self.random.borrow_mut().reseed(mixed);
        self.events.borrow_mut().clear();
        self.pickups.clear_dynamic_spawn_entities();
        self.vm.lua().expire_registry_values();

        let _scope = StackScope::new(&self.vm);
        call_level(&self.vm, &self.level, START_API, (episode, seed))?;
        Ok(())
    }

    /// The engine command line after the level has had its say.
    pub fn replace_command_line(&self, old: &str) -> Result<String> {
        let _scope = StackScope::new(&self.vm);
        let Some(count) = call_level(&self.vm, &self.level, COMMAND_LINE_API, old)? else {
            return Ok(old.to_string());
        };
        match String::read_value(self.vm.lua(), self.vm.result(count, 0)?) {
            ReadResult::Found(command_line) => Ok(command_line),
            ReadResult::NotFound => Ok(old.to_string()),
            ReadResult::TypeMismatch => Err(BridgeError::contract(
                COMMAND_LINE_API,
                "must return a string or nil",
            )),
        }
    }

    pub fn next_map(&self) -> Result<String> {
        let _scope = StackScope::new(&self.vm);
        let Some(count) = call_level(&self.vm, &self.level, NEXT_MAP_API, ())? else {
            return Ok(String::new());
        };
        match String::read_value(self.vm.lua(), self.vm.result(count, 0)?) {
            ReadResult::Found(map) => Ok(map),
            ReadResult::NotFound => Ok(String::new()),
            ReadResult::TypeMismatch => Err(BridgeError::contract(
                NEXT_MAP_API,
                "must return a string or nil",
            )),
        }
    }

    pub fn has_episode_finished(&self, episode_time_seconds: f64) -> Result<bool> {
        let _scope = StackScope::new(&self.vm);
        let Some(count) =
            call_level(&self.vm, &self.level, EPISODE_FINISHED_API, episode_time_seconds)?
        else {
            return Ok(false);
        };
        match bool::read_value(self.vm.lua(), self.vm.result(count, 0)?) {
            ReadResult::Found(finished) => Ok(finished),
            ReadResult::NotFound => Ok(false),
            ReadResult::TypeMismatch => Err(BridgeError::contract(
                EPISODE_FINISHED_API,
                "must return a boolean or nil",
            )),
        }
    }

    /// Next draw from the episode generator, for engine-side randomness.
    pub fn make_random_seed(&self) -> i32 {
        self.random.borrow_mut().next_seed()
    }

    pub fn actions(&self) -> &ActionsRegistry {
        &self.actions
    }

    pub fn apply_actions(&self, values: &[i32]) -> Result<()> {
        self.actions.apply(&self.vm, &self.level, values)
    }

    pub fn observations(&self) -> &ObservationsRegistry {
        &self.observations
    }

    pub fn observation(&mut self, index: usize) -> Result<Observation<'_>> {
        self.observations.observation(&self.vm, &self.level, index)
    }

    pub fn events(&self) -> Ref<'_, EventsRegistry> {
        self.events.borrow()
    }

    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }

    pub fn entities(&self) -> Ref<'_, EntitiesRegistry> {
        self.entities.borrow()
    }

    pub fn entities_mut(&self) -> RefMut<'_, EntitiesRegistry> {
        self.entities.borrow_mut()
    }

    pub fn pickups(&self) -> &PickupsRegistry {
        &self.pickups
    }

    pub fn find_item(&mut self, class_name: &str) -> Result<Option<usize>> {
        self.pickups.find_item(&self.vm, &self.level, class_name)
    }

    pub fn can_pickup(&self, entity_id: i32, player_id: i32) -> Result<bool> {
        self.pickups.can_pickup(&self.vm, &self.level, entity_id, player_id)
    }

    pub fn override_pickup(&self, entity_id: i32, player_id: i32) -> Result<Option<i32>> {
        self.pickups
            .override_pickup(&self.vm, &self.level, entity_id, player_id)
    }

    pub fn update_spawn_vars(&self, spawn_vars: &EntityInstance) -> Result<EntityInstance> {
        self.pickups
            .update_spawn_vars(&self.vm, &self.level, spawn_vars)
    }

    pub fn update_spawn_vars_buffer(&self, buffer: &SpawnVarsBuffer) -> Result<SpawnVarsBuffer> {
        self.pickups
            .update_spawn_vars_buffer(&self.vm, &self.level, buffer)
    }

    pub fn make_extra_entities(&mut self) -> Result<usize> {
        self.pickups.make_extra_entities(&self.vm, &self.level)
    }

    pub fn register_dynamic_items(&mut self) -> Result<Vec<String>> {
        self.pickups.register_dynamic_items(&self.vm, &self.level)
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.error_message = message.into();
    }
}
