use crate::error::{BridgeError, Result};
use crate::lua::{ScriptVm, StackScope, ValueHandle};

use super::level::{call_level, read_spec_array};

const SPEC_API: &str = "customDiscreteActionSpec";
const APPLY_API: &str = "customDiscreteActions";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    pub name: String,
    pub min: i32,
    pub max: i32,
}

/// Custom discrete actions declared by the level.
#[derive(Debug, Default)]
pub struct ActionsRegistry {
    specs: Vec<ActionSpec>,
}

impl ActionsRegistry {
    /// Replace the registry with the level's declared actions. A malformed
    /// entry leaves the registry empty.
    pub fn read_spec(&mut self, vm: &ScriptVm, level: &ValueHandle) -> Result<()> {
        self.specs.clear();
        let _scope = StackScope::new(vm);
        let Some(count) = call_level(vm, level, SPEC_API, ())? else {
            return Ok(());
        };
        let specs = read_spec_array(vm, SPEC_API, "action", vm.result(count, 0)?, |entry| {
            Ok(ActionSpec {
                name: entry.required(vm, "name")?,
                min: entry.required(vm, "min")?,
                max: entry.required(vm, "max")?,
            })
        })?;
        log::debug!("level declared {} custom actions", specs.len());
        self.specs = specs;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.specs.get(index).map(|spec| spec.name.as_str())
    }

    /// Declared `[min, max]`. Values outside it are passed on unclamped.
    pub fn bounds(&self, index: usize) -> Option<(i32, i32)> {
        self.specs.get(index).map(|spec| (spec.min, spec.max))
    }

    pub fn specs(&self) -> &[ActionSpec] {
        &self.specs
    }

    /// Hand one value per declared action to the level's applier.
    pub fn apply(&self, vm: &ScriptVm, level: &ValueHandle, values: &[i32]) -> Result<()> {
        if self.specs.is_empty() {
            return Ok(());
        }
        assert_eq!(
            values.len(),
            self.specs.len(),
            "engine passed {} action values for {} custom actions",
            values.len(),
            self.specs.len()
        );
        let _scope = StackScope::new(vm);
        let table = vm.lua().create_sequence_from(values.iter().copied())?;
        match call_level(vm, level, APPLY_API, table)? {
            Some(_) => Ok(()),
            None => Err(BridgeError::contract(
                APPLY_API,
                format!("level declares custom actions but does not define '{APPLY_API}'"),
            )),
        }
    }
}
