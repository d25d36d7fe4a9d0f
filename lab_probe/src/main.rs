use std::{fs, path::PathBuf, rc::Rc};

use anyhow::{Context as _, Result};
use clap::Parser;
use lab_bridge::{
    Context, ContextOptions, HostFileSystem, Observation, ObservationPayload, Settings,
};
use lab_wire::{EventPayload, EventView};
use serde::Serialize;
use serde_json::{json, Value};

mod cli;
mod recorder;

use cli::Args;
use recorder::{EngineCall, RecordingEngine};

/// Frames per simulated second of episode time.
const FRAME_RATE: f64 = 60.0;

#[derive(Debug, Serialize)]
struct Summary {
    level: String,
    command_line: String,
    actions: Vec<ActionSummary>,
    observations: Vec<ObservationSpecSummary>,
    dynamic_items: Vec<String>,
    extra_entities: usize,
    episodes: Vec<EpisodeSummary>,
    engine_calls: Vec<EngineCall>,
}

#[derive(Debug, Serialize)]
struct ActionSummary {
    name: String,
    min: i32,
    max: i32,
}

#[derive(Debug, Serialize)]
struct ObservationSpecSummary {
    name: String,
    kind: &'static str,
    shape: Vec<i32>,
}

#[derive(Debug, Serialize)]
struct EpisodeSummary {
    episode: i32,
    seed: i32,
    frames: u32,
    finished: bool,
    next_map: String,
    spawned_entities: usize,
    observations: Vec<ObservationSnapshot>,
    events: Vec<EventSummary>,
}

#[derive(Debug, Serialize)]
struct ObservationSnapshot {
    name: String,
    shape: Vec<i32>,
    value: Value,
}

#[derive(Debug, Serialize)]
struct EventSummary {
    frame: u32,
    name: String,
    observations: Vec<Value>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;
    init_logging(args.verbose);

    let engine = RecordingEngine::new();
    let summary = run(&args, &engine)?;

    println!("Level: {}", summary.level);
    println!(
        "Custom actions: {} | custom observations: {}",
        summary.actions.len(),
        summary.observations.len()
    );
    for episode in &summary.episodes {
        println!(
            "  episode {:>2} (seed {}): {} frames, {} events{}",
            episode.episode,
            episode.seed,
            episode.frames,
            episode.events.len(),
            if episode.finished { ", finished" } else { "" }
        );
    }
    println!("Engine calls recorded: {}", summary.engine_calls.len());

    if let Some(path) = args.summary_json.as_ref() {
        let json = serde_json::to_string_pretty(&summary).context("serializing run summary")?;
        fs::write(path, json)
            .with_context(|| format!("writing summary JSON to {}", path.display()))?;
        println!("Saved run summary to {}", path.display());
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn load_settings(args: &Args) -> Result<Settings> {
    let Some(path) = args.settings_json.as_ref() else {
        return Ok(Settings::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading settings from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing settings {}", path.display()))
}

fn run(args: &Args, engine: &RecordingEngine) -> Result<Summary> {
    let temp_folder = std::env::temp_dir().join("lab_probe");
    let options = ContextOptions {
        runfiles_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        temp_folder,
    };
    let mut context = Context::new(Rc::new(engine.clone()), Rc::new(HostFileSystem), options)?;
    context.replace_settings(load_settings(args)?);
    if let Some(dir) = args.level_directory.as_ref() {
        context.add_setting(lab_bridge::context::LEVEL_DIRECTORY_KEY, &dir.display().to_string())?;
    }
    for (key, value) in &args.settings {
        context.add_setting(key, value)?;
    }
    context.set_level_name(args.level.as_str());
    context
        .init()
        .with_context(|| format!("initialising level {}", args.level))?;

    let command_line = context.replace_command_line("")?;
    let dynamic_items = context.register_dynamic_items()?;
    let extra_entities = context.make_extra_entities()?;

    let actions = context
        .actions()
        .specs()
        .iter()
        .map(|spec| ActionSummary {
            name: spec.name.clone(),
            min: spec.min,
            max: spec.max,
        })
        .collect();
    let observations: Vec<ObservationSpecSummary> = context
        .observations()
        .entries()
        .iter()
        .map(|entry| ObservationSpecSummary {
            name: entry.name.clone(),
            kind: entry.kind.as_str(),
            shape: entry.shape.clone(),
        })
        .collect();

    let mut episodes = Vec::new();
    for episode in 0..args.episodes as i32 {
        let seed = args.seed.wrapping_add(episode);
        episodes.push(run_episode(&mut context, engine, episode, seed, args.frames)?);
    }

    Ok(Summary {
        level: args.level.clone(),
        command_line,
        actions,
        observations,
        dynamic_items,
        extra_entities,
        episodes,
        engine_calls: engine.calls(),
    })
}

fn run_episode(
    context: &mut Context,
    engine: &RecordingEngine,
    episode: i32,
    seed: i32,
    frames: u32,
) -> Result<EpisodeSummary> {
    context
        .start(episode, seed)
        .with_context(|| format!("starting episode {episode}"))?;
    let spawned_entities = context.pickups().dynamic_spawn_entity_count();
    let action_values: Vec<i32> = context.actions().specs().iter().map(|spec| spec.min).collect();
    let names: Vec<String> = context
        .observations()
        .entries()
        .iter()
        .map(|entry| entry.name.clone())
        .collect();

    let mut summary = EpisodeSummary {
        episode,
        seed,
        frames: 0,
        finished: false,
        next_map: String::new(),
        spawned_entities,
        observations: Vec::new(),
        events: Vec::new(),
    };
    for frame in 0..frames {
        let seconds = f64::from(frame) / FRAME_RATE;
        engine.set_episode_time(seconds);
        context.apply_actions(&action_values)?;
        for (index, name) in names.iter().enumerate() {
            let observation = context
                .observation(index)
                .with_context(|| format!("reading observation {name} at frame {frame}"))?;
            if frame == 0 {
                summary.observations.push(snapshot(name, &observation));
            }
        }
        {
            let events = context.events();
            for index in 0..events.count() {
                let view = events.export(index);
                let name = events.type_name(view.type_id).unwrap_or_default();
                summary.events.push(summarize_event(frame, name, &view));
            }
        }
        context.clear_events();
        summary.frames = frame + 1;
        if context.has_episode_finished(seconds)? {
            summary.finished = true;
            break;
        }
    }
    summary.next_map = context.next_map()?;
    Ok(summary)
}

fn snapshot(name: &str, observation: &Observation<'_>) -> ObservationSnapshot {
    let value = match &observation.payload {
        ObservationPayload::Bytes(bytes) => json!(bytes.to_vec()),
        ObservationPayload::Doubles(doubles) => json!(doubles.to_vec()),
        ObservationPayload::String(text) => json!(text),
    };
    ObservationSnapshot {
        name: name.to_string(),
        shape: observation.spec.shape.to_vec(),
        value,
    }
}

fn summarize_event(frame: u32, name: &str, view: &EventView<'_>) -> EventSummary {
    let observations = view
        .observations
        .iter()
        .map(|observation| match &observation.payload {
            EventPayload::Bytes(bytes) => json!(bytes),
            EventPayload::Doubles(doubles) => json!(doubles),
            EventPayload::String(text) => json!(text),
        })
        .collect();
    EventSummary {
        frame,
        name: name.to_string(),
        observations,
    }
}
