use std::cell::Ref;

use lab_wire::{ObservationSpec, ObservationType};

use crate::error::{BridgeError, Result};
use crate::lua::{ReadResult, ReadValue, ScriptVm, StackScope, ValueHandle};
use crate::tensor::{Element, Tensor};

use super::level::{call_level, read_spec_array};

const SPEC_API: &str = "customObservationSpec";
const OBSERVATION_API: &str = "customObservation";

/// One declared custom observation. An empty `shape` means the shape varies
/// per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationEntry {
    pub name: String,
    pub kind: ObservationType,
    pub shape: Vec<i32>,
}

impl ObservationEntry {
    pub fn spec(&self) -> ObservationSpec<'_> {
        ObservationSpec::new(self.kind, &self.shape)
    }
}

#[derive(Debug)]
pub enum ObservationPayload<'a> {
    Bytes(Ref<'a, [u8]>),
    Doubles(Ref<'a, [f64]>),
    String(&'a str),
}

/// Value of a custom observation, valid until the next call to
/// [`ObservationsRegistry::observation`].
#[derive(Debug)]
pub struct Observation<'a> {
    pub spec: ObservationSpec<'a>,
    pub payload: ObservationPayload<'a>,
}

/// Last observation handed out. The tensor handle keeps the script value,
/// and with it the payload storage, alive.
#[derive(Debug, Default)]
enum Retained {
    #[default]
    Empty,
    Bytes {
        _handle: ValueHandle,
        tensor: Tensor<u8>,
        shape: Vec<i32>,
    },
    Doubles {
        _handle: ValueHandle,
        tensor: Tensor<f64>,
        shape: Vec<i32>,
    },
    Text {
        text: String,
        shape: [i32; 1],
    },
}

#[derive(Debug, Default)]
pub struct ObservationsRegistry {
    entries: Vec<ObservationEntry>,
    retained: Retained,
}

impl ObservationsRegistry {
    /// Replace the registry with the level's declared observations. A
    /// malformed entry leaves the registry empty.
    pub fn read_spec(&mut self, vm: &ScriptVm, level: &ValueHandle) -> Result<()> {
        self.entries.clear();
        self.retained = Retained::Empty;
        let _scope = StackScope::new(vm);
        let Some(count) = call_level(vm, level, SPEC_API, ())? else {
            return Ok(());
        };
        let entries = read_spec_array(vm, SPEC_API, "observation", vm.result(count, 0)?, |entry| {
            let name: String = entry.required(vm, "name")?;
            let kind = match entry.optional::<String>(vm, "type")? {
                None => ObservationType::Doubles,
                Some(type_name) => ObservationType::from_name(&type_name).ok_or_else(|| {
                    format!("unknown type '{type_name}'; expected Bytes, Doubles or String")
                })?,
            };
            let shape: Vec<i32> = entry.required(vm, "shape")?;
            if let Some(dim) = shape.iter().find(|dim| **dim < 0) {
                return Err(format!("shape of '{name}' has negative dimension {dim}"));
            }
            Ok(ObservationEntry { name, kind, shape })
        })?;
        log::debug!("level declared {} custom observations", entries.len());
        self.entries = entries;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|entry| entry.name.as_str())
    }

    pub fn spec(&self, index: usize) -> Option<ObservationSpec<'_>> {
        self.entries.get(index).map(ObservationEntry::spec)
    }

    pub fn entries(&self) -> &[ObservationEntry] {
        &self.entries
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.name == name)
    }

    /// Ask the level for observation `index`. The reported shape is the one
    /// of the returned value.
    ///
    /// # Panics
    ///
    /// When `index` is not a declared observation.
    pub fn observation(
        &mut self,
        vm: &ScriptVm,
        level: &ValueHandle,
        index: usize,
    ) -> Result<Observation<'_>> {
        let entry = self.entries.get(index).unwrap_or_else(|| {
            panic!(
                "observation index {index} out of range ({} declared)",
                self.entries.len()
            )
        });
        self.retained = Retained::Empty;
        let retained = {
            let _scope = StackScope::new(vm);
            let name = entry.name.as_str();
            let count = call_level(vm, level, OBSERVATION_API, name)?.ok_or_else(|| {
                BridgeError::contract(
                    OBSERVATION_API,
                    format!("level declares observations but does not define '{OBSERVATION_API}'"),
                )
            })?;
            if count != 1 {
                return Err(BridgeError::contract(
                    OBSERVATION_API,
                    format!("'{name}' must return exactly one value; got {count}"),
                ));
            }
            let value = vm.result(count, 0)?;
            match entry.kind {
                ObservationType::Bytes => {
                    let tensor = read_tensor::<u8>(vm, name, value.clone())?;
                    Retained::Bytes {
                        _handle: ValueHandle::from_value(vm.lua(), value)?,
                        shape: dims(&tensor),
                        tensor,
                    }
                }
                ObservationType::Doubles => {
                    let tensor = read_tensor::<f64>(vm, name, value.clone())?;
                    Retained::Doubles {
                        _handle: ValueHandle::from_value(vm.lua(), value)?,
                        shape: dims(&tensor),
                        tensor,
                    }
                }
                ObservationType::String => match String::read_value(vm.lua(), value) {
                    ReadResult::Found(text) => Retained::Text {
                        shape: [text.len() as i32],
                        text,
                    },
                    _ => {
                        return Err(BridgeError::contract(
                            OBSERVATION_API,
                            format!("'{name}' must return a string"),
                        ))
                    }
                },
            }
        };
        self.retained = retained;
        Ok(self.current())
    }

    fn current(&self) -> Observation<'_> {
        match &self.retained {
            Retained::Bytes { tensor, shape, .. } => Observation {
                spec: ObservationSpec::new(ObservationType::Bytes, shape),
                payload: ObservationPayload::Bytes(contiguous(tensor)),
            },
            Retained::Doubles { tensor, shape, .. } => Observation {
                spec: ObservationSpec::new(ObservationType::Doubles, shape),
                payload: ObservationPayload::Doubles(contiguous(tensor)),
            },
            Retained::Text { text, shape } => Observation {
                spec: ObservationSpec::new(ObservationType::String, shape),
                payload: ObservationPayload::String(text),
            },
            Retained::Empty => unreachable!("observation read without a retained value"),
        }
    }
}

fn read_tensor<'vm, E: Element>(
    vm: &'vm ScriptVm,
    name: &str,
    value: mlua::Value<'vm>,
) -> Result<Tensor<E>> {
    let tensor = match Tensor::<E>::read_value(vm.lua(), value) {
        ReadResult::Found(tensor) => tensor,
        _ => {
            return Err(BridgeError::contract(
                OBSERVATION_API,
                format!("'{name}' must return a {}", E::CLASS_NAME),
            ))
        }
    };
    if !tensor.is_contiguous() {
        return Err(BridgeError::contract(
            OBSERVATION_API,
            format!("'{name}' must return a contiguous tensor"),
        ));
    }
    Ok(tensor)
}

fn contiguous<E: Element>(tensor: &Tensor<E>) -> Ref<'_, [E]> {
    match tensor.contiguous_data() {
        Some(data) => data,
        None => unreachable!("retained tensors are checked for contiguity"),
    }
}

fn dims<E: Element>(tensor: &Tensor<E>) -> Vec<i32> {
    tensor.shape().iter().map(|&size| size as i32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;
    use mlua::Value;

    fn level(vm: &ScriptVm, source: &str) -> ValueHandle {
        tensor::install(vm);
        let value: Value = vm.lua().load(source).eval().expect("level");
        ValueHandle::from_value(vm.lua(), value).expect("handle")
    }

    const LEVEL: &str = r#"
        local tensor = require 'lab.system.tensor'
        local api = {}
        function api:customObservationSpec()
          return {
            { name = 'X', type = 'Doubles', shape = {3} },
            { name = 'PIXELS', type = 'Bytes', shape = {2, 2} },
            { name = 'TEXT', type = 'String', shape = {0} },
            { name = 'DEFAULT', shape = {} },
          }
        end
        function api:customObservation(name)
          if name == 'X' then return tensor.DoubleTensor{10, 20, 30} end
          if name == 'PIXELS' then return tensor.ByteTensor{{1, 2}, {3, 4}}:transpose(1, 2) end
          if name == 'TEXT' then return 'hello' end
          return 1, 2
        end
        return api
    "#;

    #[test]
    fn doubles_observation_round_trip() {
        let vm = ScriptVm::new().expect("vm");
        let api = level(&vm, LEVEL);
        let mut observations = ObservationsRegistry::default();
        observations.read_spec(&vm, &api).expect("spec");
        assert_eq!(observations.count(), 4);
        assert_eq!(observations.index_of("X"), Some(0));
        assert_eq!(
            observations.spec(3),
            Some(ObservationSpec::new(ObservationType::Doubles, &[]))
        );

        let observation = observations.observation(&vm, &api, 0).expect("X");
        assert_eq!(observation.spec.dims(), 1);
        assert_eq!(observation.spec.shape, &[3]);
        match observation.payload {
            ObservationPayload::Doubles(values) => assert_eq!(&*values, &[10.0, 20.0, 30.0]),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn string_observation_synthesizes_shape() {
        let vm = ScriptVm::new().expect("vm");
        let api = level(&vm, LEVEL);
        let mut observations = ObservationsRegistry::default();
        observations.read_spec(&vm, &api).expect("spec");
        let observation = observations.observation(&vm, &api, 2).expect("TEXT");
        assert_eq!(observation.spec.kind, ObservationType::String);
        assert_eq!(observation.spec.shape, &[5]);
        assert!(matches!(observation.payload, ObservationPayload::String("hello")));
    }

    #[test]
    fn non_contiguous_and_multiple_returns_are_rejected() {
        let vm = ScriptVm::new().expect("vm");
        let api = level(&vm, LEVEL);
        let mut observations = ObservationsRegistry::default();
        observations.read_spec(&vm, &api).expect("spec");
        let err = observations.observation(&vm, &api, 1).expect_err("transposed");
        assert_eq!(
            err.to_string(),
            "[customObservation] - 'PIXELS' must return a contiguous tensor"
        );
        let err = observations.observation(&vm, &api, 3).expect_err("two values");
        assert_eq!(
            err.to_string(),
            "[customObservation] - 'DEFAULT' must return exactly one value; got 2"
        );
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn wrong_type_is_a_contract_error() {
        let vm = ScriptVm::new().expect("vm");
        let api = level(
            &vm,
            r#"return {
              customObservationSpec = function() return { { name = 'X', type = 'Bytes', shape = {1} } } end,
              customObservation = function() return 'text' end,
            }"#,
        );
        let mut observations = ObservationsRegistry::default();
        observations.read_spec(&vm, &api).expect("spec");
        let err = observations.observation(&vm, &api, 0).expect_err("wrong type");
        assert_eq!(
            err.to_string(),
            "[customObservation] - 'X' must return a tensor.ByteTensor"
        );
    }

    #[test]
    fn unknown_type_name_and_missing_shape_fail_the_spec() {
        let vm = ScriptVm::new().expect("vm");
        let unknown = level(
            &vm,
            "return { customObservationSpec = function() return { { name = 'X', type = 'Floats', shape = {1} } } end }",
        );
        let mut observations = ObservationsRegistry::default();
        let err = observations.read_spec(&vm, &unknown).expect_err("unknown type");
        assert_eq!(
            err.to_string(),
            "[customObservationSpec] - observation 1: unknown type 'Floats'; expected Bytes, Doubles or String"
        );

        let shapeless = level(
            &vm,
            "return { customObservationSpec = function() return { { name = 'X' } } end }",
        );
        let err = observations.read_spec(&vm, &shapeless).expect_err("no shape");
        assert_eq!(
            err.to_string(),
            "[customObservationSpec] - observation 1: missing 'shape'"
        );
        assert_eq!(observations.count(), 0);
    }

    #[test]
    fn declared_observations_without_producer_are_fatal() {
        let vm = ScriptVm::new().expect("vm");
        let api = level(
            &vm,
            "return { customObservationSpec = function() return { { name = 'X', shape = {1} } } end }",
        );
        let mut observations = ObservationsRegistry::default();
        observations.read_spec(&vm, &api).expect("spec");
        assert!(matches!(
            observations.observation(&vm, &api, 0),
            Err(BridgeError::Contract { .. })
        ));
    }
}
