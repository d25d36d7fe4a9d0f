use std::cell::RefCell;
use std::rc::Rc;

use lab_wire::ENTITY_FLAG_NODRAW;
use mlua::{IntoLuaMulti, Lua, Result as LuaResult, Table, Value};

use crate::lua::{raise, ModuleBuilder, ScriptVm};

pub const GAME_ENTITIES_MODULE: &str = "lab.system.game_entities";

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub entity_id: i32,
    pub user_id: i32,
    pub kind: i32,
    pub flags: i32,
    pub position: [f32; 3],
    pub class_name: String,
}

impl Entity {
    pub fn is_visible(&self) -> bool {
        self.flags & ENTITY_FLAG_NODRAW == 0
    }

    fn to_table<'lua>(&self, lua: &'lua Lua) -> LuaResult<Table<'lua>> {
        let table = lua.create_table()?;
        table.set("entityId", self.entity_id + 1)?;
        table.set("userId", self.user_id)?;
        table.set("type", self.kind)?;
        table.set("visible", self.is_visible())?;
        table.set("position", lua.create_sequence_from(self.position)?)?;
        table.set("classname", self.class_name.as_str())?;
        Ok(table)
    }
}

/// Per-frame snapshot of engine entities. Filled by the engine, read by
/// scripts.
#[derive(Debug, Default)]
pub struct EntitiesRegistry {
    entities: Vec<Entity>,
}

impl EntitiesRegistry {
    pub fn clear(&mut self) {
        self.entities.clear();
    }

    pub fn add(&mut self, entity: Entity) {
        self.entities.push(entity);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Entities whose class name appears in `filter`; all of them when the
    /// filter is empty.
    pub fn filtered<'a>(&'a self, filter: &'a [String]) -> impl Iterator<Item = &'a Entity> {
        self.entities
            .iter()
            .filter(move |entity| filter.is_empty() || filter.contains(&entity.class_name))
    }
}

/// Register `lab.system.game_entities` with `entities(filter)`.
pub fn install(vm: &ScriptVm, entities: Rc<RefCell<EntitiesRegistry>>) {
    vm.add_native_module(GAME_ENTITIES_MODULE, move |lua| {
        let module = ModuleBuilder::new(lua)?;
        let entities = entities.clone();
        module.function("entities", move |lua, args| {
            let filter = read_filter(args.into_iter().next())?;
            let entities = entities.borrow();
            let found = entities
                .filtered(&filter)
                .map(|entity| entity.to_table(lua))
                .collect::<LuaResult<Vec<_>>>()?;
            lua.create_sequence_from(found)?.into_lua_multi(lua)
        })?;
        Ok(module.finish())
    });
}

fn read_filter(value: Option<Value>) -> LuaResult<Vec<String>> {
    let table = match value {
        None | Some(Value::Nil) => return Ok(Vec::new()),
        Some(Value::Table(table)) => table,
        Some(other) => {
            return Err(raise(format!(
                "[game_entities.entities] - Filter must be an array of class names; received {}",
                other.type_name()
            )))
        }
    };
    let mut filter = Vec::new();
    for value in table.sequence_values::<Value>() {
        match value? {
            Value::String(name) => filter.push(name.to_str()?.to_string()),
            other => {
                return Err(raise(format!(
                    "[game_entities.entities] - Filter entries must be strings; received {}",
                    other.type_name()
                )))
            }
        }
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::error_message;

    fn entity(entity_id: i32, class_name: &str, flags: i32) -> Entity {
        Entity {
            entity_id,
            user_id: entity_id * 10,
            kind: 3,
            flags,
            position: [1.0, 2.0, 3.0],
            class_name: class_name.to_string(),
        }
    }

    #[test]
    fn filter_selects_by_class_name() {
        let mut registry = EntitiesRegistry::default();
        registry.add(entity(0, "apple", 0));
        registry.add(entity(1, "pear", 0));
        registry.add(entity(2, "apple", ENTITY_FLAG_NODRAW));
        assert_eq!(registry.filtered(&[]).count(), 3);
        let apples = vec!["apple".to_string()];
        let ids: Vec<i32> = registry.filtered(&apples).map(|e| e.entity_id).collect();
        assert_eq!(ids, vec![0, 2]);
        assert!(!registry.entities()[2].is_visible());
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn script_sees_one_based_ids_and_visibility() {
        let vm = ScriptVm::new().expect("vm");
        let registry = Rc::new(RefCell::new(EntitiesRegistry::default()));
        registry.borrow_mut().add(entity(0, "apple", 0));
        registry.borrow_mut().add(entity(4, "pear", ENTITY_FLAG_NODRAW));
        install(&vm, registry.clone());

        let summary: String = vm
            .lua()
            .load(
                r#"
                local ge = require 'lab.system.game_entities'
                local out = {}
                for _, e in ipairs(ge.entities()) do
                  out[#out + 1] = string.format('%d:%d:%s:%s:%g', e.entityId, e.userId,
                      e.classname, tostring(e.visible), e.position[3])
                end
                return table.concat(out, ' ')
                "#,
            )
            .eval()
            .expect("query");
        assert_eq!(summary, "1:0:apple:true:3 5:40:pear:false:3");

        let count: i64 = vm
            .lua()
            .load("return #require('lab.system.game_entities'):entities{'pear'}")
            .eval()
            .expect("filtered");
        assert_eq!(count, 1);

        let (x, length): (f64, usize) = vm
            .lua()
            .load("local p = require('lab.system.game_entities').entities()[1].position; return p[1], #p")
            .eval()
            .expect("position");
        assert_eq!((x, length), (1.0, 3));

        let err = vm
            .lua()
            .load("require('lab.system.game_entities').entities('apple')")
            .exec()
            .expect_err("string filter");
        assert_eq!(
            error_message(&err),
            "[game_entities.entities] - Filter must be an array of class names; received string"
        );
    }
}
