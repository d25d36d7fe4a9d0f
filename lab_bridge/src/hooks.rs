//! Status-code view of a [`Context`] for engines that drive the bridge
//! through a flat hook table.

use lab_wire::{EntityInstance, EventView, ObservationSpec, SpawnVarsBuffer};

use crate::context::{Context, Entity, Observation, PickupItem};
use crate::error::Result;

pub const STATUS_OK: i32 = 0;
pub const STATUS_ERROR: i32 = 1;

/// Hooks the engine invokes. Fallible hooks return [`STATUS_OK`] or
/// [`STATUS_ERROR`]; after an error the message is available from
/// [`EngineHooks::error_message`].
pub trait EngineHooks {
    fn set_level_name(&mut self, name: &str);
    fn add_setting(&mut self, key: &str, value: &str) -> i32;
    fn init(&mut self) -> i32;
    fn start(&mut self, episode: i32, seed: i32) -> i32;
    fn replace_command_line(&mut self, old: &str, command_line: &mut String) -> i32;
    fn next_map(&mut self, map: &mut String) -> i32;
    fn has_episode_finished(&mut self, episode_time_seconds: f64, finished: &mut bool) -> i32;
    fn make_random_seed(&mut self) -> i32;

    fn custom_action_discrete_count(&self) -> usize;
    fn custom_action_discrete_name(&self, index: usize) -> &str;
    fn custom_action_discrete_bounds(&self, index: usize) -> (i32, i32);
    fn custom_action_discrete_apply(&mut self, values: &[i32]) -> i32;

    fn custom_observation_count(&self) -> usize;
    fn custom_observation_name(&self, index: usize) -> &str;
    fn custom_observation_spec(&self, index: usize) -> ObservationSpec<'_>;
    /// The observation is only valid inside `sink`.
    fn custom_observation(&mut self, index: usize, sink: &mut dyn FnMut(&Observation<'_>)) -> i32;

    fn event_type_count(&self) -> usize;
    fn event_type_name(&self, type_id: usize) -> String;
    fn event_count(&self) -> usize;
    fn export_event(&self, index: usize, sink: &mut dyn FnMut(&EventView<'_>));
    fn clear_events(&mut self);

    fn find_item(&mut self, class_name: &str, index: &mut Option<usize>) -> i32;
    fn item(&self, index: usize) -> Option<PickupItem>;
    fn can_pickup(&mut self, entity_id: i32, player_id: i32, allowed: &mut bool) -> i32;
    fn override_pickup(
        &mut self,
        entity_id: i32,
        player_id: i32,
        respawn: &mut Option<i32>,
    ) -> i32;
    fn update_spawn_vars(&mut self, spawn_vars: &mut SpawnVarsBuffer) -> i32;
    fn make_extra_entities(&mut self, count: &mut usize) -> i32;
    fn read_extra_entity(&self, index: usize) -> Option<SpawnVarsBuffer>;
    fn register_dynamic_items(&mut self, class_names: &mut Vec<String>) -> i32;
    fn dynamic_spawn_entity_count(&self) -> usize;
    fn read_dynamic_spawn_entity(&self, index: usize) -> Option<SpawnVarsBuffer>;
    fn clear_dynamic_spawn_entities(&mut self);

    fn entities_clear(&mut self);
    fn entities_add(&mut self, entity: Entity);

    fn error_message(&self) -> &str;
    fn set_error_message(&mut self, message: &str);
}

fn report<T>(context: &mut Context, result: Result<T>, store: impl FnOnce(T)) -> i32 {
    match result {
        Ok(value) => {
            store(value);
            STATUS_OK
        }
        Err(err) => {
            let message = err.to_string();
            log::error!("{message}");
            context.set_error_message(message);
            STATUS_ERROR
        }
    }
}

// Entities are size-checked when the level hands them over.
fn encode(vars: &EntityInstance) -> SpawnVarsBuffer {
    match SpawnVarsBuffer::encode(vars) {
        Ok(buffer) => buffer,
        Err(err) => panic!("spawn vars accepted by the bridge failed to encode: {err}"),
    }
}

impl EngineHooks for Context {
    fn set_level_name(&mut self, name: &str) {
        Context::set_level_name(self, name);
    }

    fn add_setting(&mut self, key: &str, value: &str) -> i32 {
        let result = Context::add_setting(self, key, value);
        report(self, result, |_| ())
    }

    fn init(&mut self) -> i32 {
        let result = Context::init(self);
        report(self, result, |_| ())
    }

    fn start(&mut self, episode: i32, seed: i32) -> i32 {
        let result = Context::start(self, episode, seed);
        report(self, result, |_| ())
    }

    fn replace_command_line(&mut self, old: &str, command_line: &mut String) -> i32 {
        let result = Context::replace_command_line(self, old);
        report(self, result, |value| *command_line = value)
    }

    fn next_map(&mut self, map: &mut String) -> i32 {
        let result = Context::next_map(self);
        report(self, result, |value| *map = value)
    }

    fn has_episode_finished(&mut self, episode_time_seconds: f64, finished: &mut bool) -> i32 {
        let result = Context::has_episode_finished(self, episode_time_seconds);
        report(self, result, |value| *finished = value)
    }

    fn make_random_seed(&mut self) -> i32 {
        Context::make_random_seed(self)
    }

    fn custom_action_discrete_count(&self) -> usize {
        self.actions().count()
    }

    fn custom_action_discrete_name(&self, index: usize) -> &str {
        let actions = self.actions();
        actions
            .name(index)
            .unwrap_or_else(|| out_of_range("action", index, actions.count()))
    }

    fn custom_action_discrete_bounds(&self, index: usize) -> (i32, i32) {
        let actions = self.actions();
        actions
            .bounds(index)
            .unwrap_or_else(|| out_of_range("action", index, actions.count()))
    }

    fn custom_action_discrete_apply(&mut self, values: &[i32]) -> i32 {
        let result = self.apply_actions(values);
        report(self, result, |_| ())
    }

    fn custom_observation_count(&self) -> usize {
        self.observations().count()
    }

    fn custom_observation_name(&self, index: usize) -> &str {
        let observations = self.observations();
        observations
            .name(index)
            .unwrap_or_else(|| out_of_range("observation", index, observations.count()))
    }

    fn custom_observation_spec(&self, index: usize) -> ObservationSpec<'_> {
        let observations = self.observations();
        observations
            .spec(index)
            .unwrap_or_else(|| out_of_range("observation", index, observations.count()))
    }

    fn custom_observation(&mut self, index: usize, sink: &mut dyn FnMut(&Observation<'_>)) -> i32 {
        let result = self.observation(index).map(|observation| sink(&observation));
        report(self, result, |_| ())
    }

    fn event_type_count(&self) -> usize {
        self.events().type_count()
    }

    fn event_type_name(&self, type_id: usize) -> String {
        let events = self.events();
        match events.type_name(type_id) {
            Some(name) => name.to_string(),
            None => out_of_range("event type", type_id, events.type_count()),
        }
    }

    fn event_count(&self) -> usize {
        self.events().count()
    }

    fn export_event(&self, index: usize, sink: &mut dyn FnMut(&EventView<'_>)) {
        let events = self.events();
        sink(&events.export(index));
    }

    fn clear_events(&mut self) {
        Context::clear_events(self);
    }

    fn find_item(&mut self, class_name: &str, index: &mut Option<usize>) -> i32 {
        let result = Context::find_item(self, class_name);
        report(self, result, |value| *index = value)
    }

    fn item(&self, index: usize) -> Option<PickupItem> {
        self.pickups().item(index).cloned()
    }

    fn can_pickup(&mut self, entity_id: i32, player_id: i32, allowed: &mut bool) -> i32 {
        let result = Context::can_pickup(self, entity_id, player_id);
        report(self, result, |value| *allowed = value)
    }

    fn override_pickup(
        &mut self,
        entity_id: i32,
        player_id: i32,
        respawn: &mut Option<i32>,
    ) -> i32 {
        let result = Context::override_pickup(self, entity_id, player_id);
        report(self, result, |value| *respawn = value)
    }

    fn update_spawn_vars(&mut self, spawn_vars: &mut SpawnVarsBuffer) -> i32 {
        let result = self.update_spawn_vars_buffer(spawn_vars);
        report(self, result, |value| *spawn_vars = value)
    }

    fn make_extra_entities(&mut self, count: &mut usize) -> i32 {
        let result = Context::make_extra_entities(self);
        report(self, result, |value| *count = value)
    }

    fn read_extra_entity(&self, index: usize) -> Option<SpawnVarsBuffer> {
        self.pickups().extra_entity(index).map(encode)
    }

    fn register_dynamic_items(&mut self, class_names: &mut Vec<String>) -> i32 {
        let result = Context::register_dynamic_items(self);
        report(self, result, |value| *class_names = value)
    }

    fn dynamic_spawn_entity_count(&self) -> usize {
        self.pickups().dynamic_spawn_entity_count()
    }

    fn read_dynamic_spawn_entity(&self, index: usize) -> Option<SpawnVarsBuffer> {
        self.pickups()
            .dynamic_spawn_entity(index)
            .as_ref()
            .map(encode)
    }

    fn clear_dynamic_spawn_entities(&mut self) {
        self.pickups().clear_dynamic_spawn_entities();
    }

    fn entities_clear(&mut self) {
        self.entities_mut().clear();
    }

    fn entities_add(&mut self, entity: Entity) {
        self.entities_mut().add(entity);
    }

    fn error_message(&self) -> &str {
        Context::error_message(self)
    }

    fn set_error_message(&mut self, message: &str) {
        Context::set_error_message(self, message);
    }
}

fn out_of_range(what: &str, index: usize, declared: usize) -> ! {
    panic!("{what} index {index} out of range ({declared} declared)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use crate::context::{ContextOptions, EngineCalls};
    use crate::file_system::HostFileSystem;

    struct NoEngine;

    impl EngineCalls for NoEngine {}

    fn context() -> Context {
        Context::new(
            Rc::new(NoEngine),
            Rc::new(HostFileSystem),
            ContextOptions::default(),
        )
        .expect("context")
    }

    #[test]
    fn failures_leave_a_message() {
        let mut context = context();
        let hooks: &mut dyn EngineHooks = &mut context;
        assert_eq!(hooks.add_setting("mixerSeed", "seven"), STATUS_ERROR);
        assert!(hooks.error_message().starts_with("invalid setting mixerSeed=seven"));

        hooks.set_error_message("engine side failure");
        assert_eq!(hooks.error_message(), "engine side failure");

        let mut command_line = String::new();
        assert_eq!(
            hooks.replace_command_line("lab", &mut command_line),
            STATUS_ERROR
        );
        assert_eq!(hooks.error_message(), "[commandLine] - level script is not loaded");
        assert!(command_line.is_empty());
        assert_eq!(hooks.custom_observation_count(), 0);
    }

    #[test]
    #[should_panic(expected = "action index 5 out of range (0 declared)")]
    fn action_name_past_the_declared_range_aborts() {
        context().custom_action_discrete_name(5);
    }

    #[test]
    #[should_panic(expected = "action index 5 out of range (0 declared)")]
    fn action_bounds_past_the_declared_range_abort() {
        context().custom_action_discrete_bounds(5);
    }

    #[test]
    #[should_panic(expected = "observation index 5 out of range (0 declared)")]
    fn observation_name_past_the_declared_range_aborts() {
        context().custom_observation_name(5);
    }

    #[test]
    #[should_panic(expected = "observation index 0 out of range (0 declared)")]
    fn observation_spec_past_the_declared_range_aborts() {
        context().custom_observation_spec(0);
    }

    #[test]
    #[should_panic(expected = "event type index 9 out of range (0 declared)")]
    fn event_type_name_past_the_declared_range_aborts() {
        context().event_type_name(9);
    }
}
