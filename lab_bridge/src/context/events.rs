use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use lab_wire::{EventObservation, EventPayload, EventView, ObservationSpec, ObservationType};
use mlua::{IntoLuaMulti, Value};

use crate::lua::{raise, ModuleBuilder, ReadResult, ReadValue, ScriptVm};
use crate::tensor::{Element, Tensor};

pub const EVENTS_MODULE: &str = "lab.system.events";

#[derive(Debug, Clone, Copy)]
struct StoredObservation {
    kind: ObservationType,
    shape_id: usize,
    payload_id: usize,
}

#[derive(Debug)]
struct EventRecord {
    type_id: usize,
    observations: Vec<StoredObservation>,
}

/// Events raised by the level during a frame.
///
/// Event type names are interned for the life of the registry, so type ids
/// stay valid across [`EventsRegistry::clear`]; occurrences and their
/// payloads do not.
#[derive(Debug, Default)]
pub struct EventsRegistry {
    names: Vec<String>,
    ids: HashMap<String, usize>,
    events: Vec<EventRecord>,
    shapes: Vec<Vec<i32>>,
    strings: Vec<String>,
    bytes: Vec<Vec<u8>>,
    doubles: Vec<Vec<f64>>,
}

impl EventsRegistry {
    /// Record an occurrence of event `name` and return its occurrence id.
    pub fn add(&mut self, name: &str) -> usize {
        let type_id = match self.ids.get(name) {
            Some(&type_id) => type_id,
            None => {
                let type_id = self.names.len();
                self.names.push(name.to_string());
                self.ids.insert(name.to_string(), type_id);
                type_id
            }
        };
        self.events.push(EventRecord {
            type_id,
            observations: Vec::new(),
        });
        self.events.len() - 1
    }

    pub fn add_string(&mut self, event_id: usize, text: &str) {
        let shape_id = self.add_shape(vec![text.len() as i32]);
        self.strings.push(text.to_string());
        let payload_id = self.strings.len() - 1;
        self.push_observation(event_id, ObservationType::String, shape_id, payload_id);
    }

    pub fn add_bytes(&mut self, event_id: usize, tensor: &Tensor<u8>) {
        let shape_id = self.add_shape(dims(tensor));
        self.bytes.push(tensor.to_vec());
        let payload_id = self.bytes.len() - 1;
        self.push_observation(event_id, ObservationType::Bytes, shape_id, payload_id);
    }

    pub fn add_doubles(&mut self, event_id: usize, tensor: &Tensor<f64>) {
        let shape_id = self.add_shape(dims(tensor));
        self.doubles.push(tensor.to_vec());
        let payload_id = self.doubles.len() - 1;
        self.push_observation(event_id, ObservationType::Doubles, shape_id, payload_id);
    }

    /// Occurrences since the last clear.
    pub fn count(&self) -> usize {
        self.events.len()
    }

    /// Distinct event names seen so far.
    pub fn type_count(&self) -> usize {
        self.names.len()
    }

    pub fn type_name(&self, type_id: usize) -> Option<&str> {
        self.names.get(type_id).map(String::as_str)
    }

    pub fn type_id(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    /// View of occurrence `index` pointing into the registry's storage.
    ///
    /// # Panics
    ///
    /// When `index` is not below [`EventsRegistry::count`].
    pub fn export(&self, index: usize) -> EventView<'_> {
        let event = &self.events[index];
        let observations = event
            .observations
            .iter()
            .map(|stored| {
                let shape = &self.shapes[stored.shape_id];
                let payload = match stored.kind {
                    ObservationType::Bytes => EventPayload::Bytes(&self.bytes[stored.payload_id]),
                    ObservationType::Doubles => {
                        EventPayload::Doubles(&self.doubles[stored.payload_id])
                    }
                    ObservationType::String => {
                        EventPayload::String(&self.strings[stored.payload_id])
                    }
                };
                EventObservation {
                    spec: ObservationSpec::new(stored.kind, shape),
                    payload,
                }
            })
            .collect();
        EventView {
            type_id: event.type_id,
            observations,
        }
    }

    /// Drop every occurrence and payload. Type ids are kept.
    pub fn clear(&mut self) {
        self.events.clear();
        self.shapes.clear();
        self.strings.clear();
        self.bytes.clear();
        self.doubles.clear();
    }

    fn add_shape(&mut self, shape: Vec<i32>) -> usize {
        self.shapes.push(shape);
        self.shapes.len() - 1
    }

    fn push_observation(
        &mut self,
        event_id: usize,
        kind: ObservationType,
        shape_id: usize,
        payload_id: usize,
    ) {
        let count = self.events.len();
        let event = self
            .events
            .get_mut(event_id)
            .unwrap_or_else(|| panic!("event {event_id} out of range ({count} recorded)"));
        event.observations.push(StoredObservation {
            kind,
            shape_id,
            payload_id,
        });
    }
}

fn dims<E: Element>(tensor: &Tensor<E>) -> Vec<i32> {
    tensor.shape().iter().map(|&size| size as i32).collect()
}

/// Register `lab.system.events` with `add(name, ...)`.
pub fn install(vm: &ScriptVm, events: Rc<RefCell<EventsRegistry>>) {
    vm.add_native_module(EVENTS_MODULE, move |lua| {
        let module = ModuleBuilder::new(lua)?;
        let events = events.clone();
        module.function("add", move |lua, args| {
            let mut args = args.into_iter();
            let name = match args.next() {
                Some(Value::String(name)) => name.to_str()?.to_string(),
                _ => return Err(raise("[events.add] - Event name must be a string")),
            };
            let mut events = events.borrow_mut();
            let event_id = events.add(&name);
            for (position, value) in args.enumerate() {
                if let Value::String(text) = &value {
                    events.add_string(event_id, text.to_str()?);
                } else if let ReadResult::Found(tensor) = Tensor::<u8>::read_value(lua, value.clone()) {
                    events.add_bytes(event_id, &tensor);
                } else if let ReadResult::Found(tensor) = Tensor::<f64>::read_value(lua, value.clone()) {
                    events.add_doubles(event_id, &tensor);
                } else {
                    return Err(raise(format!(
                        "[events.add] - Observation {} must be a string, ByteTensor or DoubleTensor; received {}",
                        position + 1,
                        value.type_name()
                    )));
                }
            }
            ().into_lua_multi(lua)
        })?;
        Ok(module.finish())
    });
}
