use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use lab_wire::{EntityInstance, SpawnVarsBuffer, MAX_PICKUP_STRING_CHARS};
use mlua::{IntoLuaMulti, Lua, Table, Value};

use crate::error::{BridgeError, Result};
use crate::lua::{raise, ModuleBuilder, ReadResult, ReadValue, ScriptVm, StackScope, ValueHandle};

use super::level::call_level;

pub const PICKUPS_SPAWN_MODULE: &str = "lab.system.pickups_spawn";

const CREATE_API: &str = "createPickup";
const CAN_PICKUP_API: &str = "canPickup";
const PICKUP_API: &str = "pickup";
const SPAWN_VARS_API: &str = "updateSpawnVars";
const EXTRA_ENTITIES_API: &str = "extraEntities";
const DYNAMIC_ITEMS_API: &str = "registerDynamicItems";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveType {
    #[default]
    Bob,
    Static,
}

impl MoveType {
    fn from_script(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Bob),
            1 => Some(Self::Static),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickupItem {
    pub name: String,
    pub class_name: String,
    pub model_name: String,
    pub quantity: i32,
    pub kind: i32,
    pub tag: i32,
    pub move_type: MoveType,
}

/// Pickup descriptions, level-driven entity edits and dynamically spawned
/// entities.
#[derive(Debug, Default)]
pub struct PickupsRegistry {
    items: Vec<PickupItem>,
    by_class: HashMap<String, usize>,
    extra_entities: Vec<EntityInstance>,
    spawns: Rc<RefCell<Vec<EntityInstance>>>,
}

impl PickupsRegistry {
    /// Index of the item for `class_name`, asking the level to describe it
    /// the first time. `None` when the level does not know the class.
    pub fn find_item(
        &mut self,
        vm: &ScriptVm,
        level: &ValueHandle,
        class_name: &str,
    ) -> Result<Option<usize>> {
        if let Some(&index) = self.by_class.get(class_name) {
            return Ok(Some(index));
        }
        let _scope = StackScope::new(vm);
        let Some(count) = call_level(vm, level, CREATE_API, class_name)? else {
            return Ok(None);
        };
        let description = match ValueHandle::read_value(vm.lua(), vm.result(count, 0)?) {
            ReadResult::Found(description) if description.is_table(vm) => description,
            ReadResult::NotFound => return Ok(None),
            _ => {
                return Err(BridgeError::contract(
                    CREATE_API,
                    format!("'{class_name}': must return a table or nil"),
                ))
            }
        };
        let item = read_item(vm, &description).map_err(|reason| {
            BridgeError::contract(CREATE_API, format!("'{class_name}': {reason}"))
        })?;
        log::debug!("registered pickup {} as {}", item.class_name, item.name);
        self.items.push(item);
        let index = self.items.len() - 1;
        self.by_class.insert(class_name.to_string(), index);
        Ok(Some(index))
    }

    pub fn item(&self, index: usize) -> Option<&PickupItem> {
        self.items.get(index)
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn clear_items(&mut self) {
        self.items.clear();
        self.by_class.clear();
    }

    /// Whether `player_id` may pick up `entity_id`. Allowed unless the level
    /// says otherwise.
    pub fn can_pickup(
        &self,
        vm: &ScriptVm,
        level: &ValueHandle,
        entity_id: i32,
        player_id: i32,
    ) -> Result<bool> {
        let _scope = StackScope::new(vm);
        let Some(count) = call_level(vm, level, CAN_PICKUP_API, (entity_id, player_id))? else {
            return Ok(true);
        };
        match bool::read_value(vm.lua(), vm.result(count, 0)?) {
            ReadResult::Found(allowed) => Ok(allowed),
            ReadResult::NotFound => Ok(true),
            ReadResult::TypeMismatch => Err(BridgeError::contract(
                CAN_PICKUP_API,
                "must return a boolean or nil",
            )),
        }
    }

    /// Respawn time chosen by the level for this pickup, `None` for the
    /// engine default.
    pub fn override_pickup(
        &self,
        vm: &ScriptVm,
        level: &ValueHandle,
        entity_id: i32,
        player_id: i32,
    ) -> Result<Option<i32>> {
        let _scope = StackScope::new(vm);
        let Some(count) = call_level(vm, level, PICKUP_API, (entity_id, player_id))? else {
            return Ok(None);
        };
        match i32::read_value(vm.lua(), vm.result(count, 0)?) {
            ReadResult::Found(respawn) => Ok(Some(respawn)),
            ReadResult::NotFound => Ok(None),
            ReadResult::TypeMismatch => Err(BridgeError::contract(
                PICKUP_API,
                "must return an integer or nil",
            )),
        }
    }

    /// Let the level rewrite an entity's spawn vars. Returned unchanged when
    /// the level has no opinion.
    pub fn update_spawn_vars(
        &self,
        vm: &ScriptVm,
        level: &ValueHandle,
        spawn_vars: &EntityInstance,
    ) -> Result<EntityInstance> {
        let _scope = StackScope::new(vm);
        let table = entity_table(vm.lua(), spawn_vars)?;
        let Some(count) = call_level(vm, level, SPAWN_VARS_API, table)? else {
            return Ok(spawn_vars.clone());
        };
        match vm.result(count, 0)? {
            Value::Nil => Ok(spawn_vars.clone()),
            Value::Table(table) => read_entity(&table)
                .map_err(|reason| BridgeError::contract(SPAWN_VARS_API, reason)),
            _ => Err(BridgeError::contract(
                SPAWN_VARS_API,
                "must return a table or nil",
            )),
        }
    }

    /// Boundary form of [`PickupsRegistry::update_spawn_vars`].
    pub fn update_spawn_vars_buffer(
        &self,
        vm: &ScriptVm,
        level: &ValueHandle,
        buffer: &SpawnVarsBuffer,
    ) -> Result<SpawnVarsBuffer> {
        let updated = self.update_spawn_vars(vm, level, &buffer.decode()?)?;
        Ok(SpawnVarsBuffer::encode(&updated)?)
    }

    /// Ask the level for entities to add to the map. Returns how many it
    /// supplied; previous extra entities are replaced.
    pub fn make_extra_entities(&mut self, vm: &ScriptVm, level: &ValueHandle) -> Result<usize> {
        self.extra_entities.clear();
        let _scope = StackScope::new(vm);
        let Some(count) = call_level(vm, level, EXTRA_ENTITIES_API, ())? else {
            return Ok(0);
        };
        let entities = match vm.result(count, 0)? {
            Value::Nil => return Ok(0),
            Value::Table(entities) => entities,
            _ => {
                return Err(BridgeError::contract(
                    EXTRA_ENTITIES_API,
                    "must return an array of tables or nil",
                ))
            }
        };
        let mut extra = Vec::new();
        for (index, entity) in entities.sequence_values::<Value>().enumerate() {
            let Value::Table(entity) = entity? else {
                return Err(BridgeError::contract(
                    EXTRA_ENTITIES_API,
                    format!("entity {}: must be a table", index + 1),
                ));
            };
            let vars = read_entity(&entity).map_err(|reason| {
                BridgeError::contract(EXTRA_ENTITIES_API, format!("entity {}: {reason}", index + 1))
            })?;
            SpawnVarsBuffer::encode(&vars)?;
            extra.push(vars);
        }
        self.extra_entities = extra;
        Ok(self.extra_entities.len())
    }

    pub fn extra_entity(&self, index: usize) -> Option<&EntityInstance> {
        self.extra_entities.get(index)
    }

    pub fn extra_entity_count(&self) -> usize {
        self.extra_entities.len()
    }

    /// Class names the level wants registered up front. Each one must
    /// resolve to an item.
    pub fn register_dynamic_items(
        &mut self,
        vm: &ScriptVm,
        level: &ValueHandle,
    ) -> Result<Vec<String>> {
        let class_names = {
            let _scope = StackScope::new(vm);
            let Some(count) = call_level(vm, level, DYNAMIC_ITEMS_API, ())? else {
                return Ok(Vec::new());
            };
            match Vec::<String>::read_value(vm.lua(), vm.result(count, 0)?) {
                ReadResult::Found(names) => names,
                ReadResult::NotFound => return Ok(Vec::new()),
                ReadResult::TypeMismatch => {
                    return Err(BridgeError::contract(
                        DYNAMIC_ITEMS_API,
                        "must return an array of class names or nil",
                    ))
                }
            }
        };
        for class_name in &class_names {
            if self.find_item(vm, level, class_name)?.is_none() {
                return Err(BridgeError::contract(
                    DYNAMIC_ITEMS_API,
                    format!("'{class_name}' is not a pickup the level can create"),
                ));
            }
        }
        Ok(class_names)
    }

    pub fn dynamic_spawn_entity_count(&self) -> usize {
        self.spawns.borrow().len()
    }

    pub fn dynamic_spawn_entity(&self, index: usize) -> Option<EntityInstance> {
        self.spawns.borrow().get(index).cloned()
    }

    pub fn clear_dynamic_spawn_entities(&self) {
        self.spawns.borrow_mut().clear();
    }

    pub(crate) fn spawn_queue(&self) -> Rc<RefCell<Vec<EntityInstance>>> {
        self.spawns.clone()
    }
}

fn read_item(vm: &ScriptVm, description: &ValueHandle) -> std::result::Result<PickupItem, String> {
    let move_type = match description.optional::<i32>(vm, "moveType")? {
        Some(value) => Some(value),
        None => description.optional::<i32>(vm, "move_type")?,
    };
    let move_type = match move_type {
        None => MoveType::default(),
        Some(value) => MoveType::from_script(value)
            .ok_or_else(|| format!("'moveType' {value} is not BOB (0) or STATIC (1)"))?,
    };
    let item = PickupItem {
        name: description.required(vm, "name")?,
        class_name: description.required(vm, "classname")?,
        model_name: description.required(vm, "model")?,
        quantity: description.required(vm, "quantity")?,
        kind: description.required(vm, "type")?,
        tag: description.optional(vm, "tag")?.unwrap_or(0),
        move_type,
    };
    for (field, value) in [
        ("name", &item.name),
        ("classname", &item.class_name),
        ("model", &item.model_name),
    ] {
        if value.len() >= MAX_PICKUP_STRING_CHARS {
            return Err(format!(
                "'{field}' is {} chars; at most {} are supported",
                value.len(),
                MAX_PICKUP_STRING_CHARS - 1
            ));
        }
    }
    Ok(item)
}

fn entity_table<'lua>(lua: &'lua Lua, vars: &EntityInstance) -> mlua::Result<Table<'lua>> {
    lua.create_table_from(vars.iter().map(|(key, value)| (key.as_str(), value.as_str())))
}

fn read_entity(table: &Table) -> std::result::Result<EntityInstance, String> {
    let mut vars = EntityInstance::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, value) = pair.map_err(|err| err.to_string())?;
        let (Value::String(key), Value::String(value)) = (&key, &value) else {
            return Err(format!(
                "spawn vars must map strings to strings; found {} = {}",
                key.type_name(),
                value.type_name()
            ));
        };
        let key = key.to_str().map_err(|err| err.to_string())?;
        let value = value.to_str().map_err(|err| err.to_string())?;
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Register `lab.system.pickups_spawn` with `spawn(spawnVars)` and `clear()`.
pub fn install(vm: &ScriptVm, spawns: Rc<RefCell<Vec<EntityInstance>>>) {
    vm.add_native_module(PICKUPS_SPAWN_MODULE, move |lua| {
        let module = ModuleBuilder::new(lua)?;
        let queue = spawns.clone();
        module.function("spawn", move |lua, args| {
            let Some(Value::Table(table)) = args.first() else {
                return Err(raise("[pickups_spawn.spawn] - Spawn vars must be a table"));
            };
            let vars = read_entity(table)
                .map_err(|reason| raise(format!("[pickups_spawn.spawn] - {reason}")))?;
            SpawnVarsBuffer::encode(&vars)
                .map_err(|err| raise(format!("[pickups_spawn.spawn] - {err}")))?;
            queue.borrow_mut().push(vars);
            ().into_lua_multi(lua)
        })?;
        let queue = spawns.clone();
        module.function("clear", move |lua, _| {
            queue.borrow_mut().clear();
            ().into_lua_multi(lua)
        })?;
        Ok(module.finish())
    });
}
