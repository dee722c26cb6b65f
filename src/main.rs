use cuepoint::cli::Args;
use cuepoint::config::EngineConfig;
use cuepoint::core::decoder::DecoderOptions;
use cuepoint::core::events::{channel, EngineEvent, EventReceiver};
use cuepoint::core::pattern::PatternSource;
use cuepoint::core::subtitles::SubtitleCompositor;
use cuepoint::core::sync_engine::SyncEngine;
use cuepoint::paths::{self, PathConfig};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::path::Path;
use std::time::Duration;

const PATTERN_SIZE: (usize, usize) = (640, 360);
const PATTERN_FPS: f64 = 30.0;
const PATTERN_DURATION: f64 = 10.0;

fn init_logger(args: &Args) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let (level, default_level) = match args.verbosity {
        0 => (log::LevelFilter::Warn, "warn"),
        1 => (log::LevelFilter::Info, "info"),
        2 => (log::LevelFilter::Debug, "debug"),
        _ => (log::LevelFilter::Trace, "trace"),
    };

    if let Some(log_path) = &args.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;
        env_logger::Builder::new()
            .filter_level(level)
            .filter_module("cosmic_text", log::LevelFilter::Warn)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
        info!("Logging to file: {} (level: {:?})", log_path.display(), level);
    } else {
        // Respects RUST_LOG if set
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .filter_module("cosmic_text", log::LevelFilter::Warn)
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn print_events(events: &EventReceiver) {
    for event in events.poll() {
        match event {
            EngineEvent::PositionChanged(t) => println!("position {:.3}", t),
            EngineEvent::MediaEnded => println!("ended"),
        }
    }
}

fn write_snapshot(engine: &SyncEngine, out: &Path) -> Result<()> {
    let presenter = engine.presenter();
    presenter.run_pending();
    let image = presenter.snapshot();
    if image.width == 0 || image.height == 0 {
        anyhow::bail!("Nothing has been presented yet");
    }
    image::save_buffer(
        out,
        &image.to_rgba(),
        image.width as u32,
        image.height as u32,
        image::ExtendedColorType::Rgba8,
    )
    .with_context(|| format!("Failed to write snapshot: {}", out.display()))?;
    info!("Snapshot {}x{} written to {}", image.width, image.height, out.display());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args)?;
    debug!("Command-line args: {:?}", args);

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    let config = EngineConfig::load(&path_config)?;
    info!(
        "Config path: {}",
        paths::config_file(paths::CONFIG_FILE, &path_config).display()
    );

    let (tx, events) = channel(config.event_queue);
    let engine = SyncEngine::new(&config, tx)?;

    let media = if args.pattern {
        let (w, h) = PATTERN_SIZE;
        engine.load(Box::new(PatternSource::new(w, h, PATTERN_FPS, PATTERN_DURATION)))?
    } else if let Some(path) = &args.file_path {
        if let Err(e) = paths::ensure_dir(&config.keyframe_dir(&path_config)) {
            warn!("Keyframe cache disabled: {}", e);
        }
        engine
            .load_file(path, &DecoderOptions::from_config(&config, &path_config))
            .with_context(|| format!("Failed to open {}", path.display()))?
    } else {
        anyhow::bail!("No input: pass a FILE or --pattern");
    };
    println!(
        "media {}x{} {:.3}fps {:.3}s",
        media.width, media.height, media.fps, media.duration
    );

    if let Some(subs) = &args.subs {
        let compositor = SubtitleCompositor::from_file(subs)
            .with_context(|| format!("Failed to read subtitles: {}", subs.display()))?;
        println!("subtitles {} cues", compositor.script().cues.len());
        engine.set_subtitles(Box::new(compositor));
    }

    if let Some(seek) = args.seek {
        let pos = engine.seek_to(seek)?;
        debug!("Seek {:.3}s -> {:.3}s", seek, pos);
    }

    let times = if args.at.is_empty() && args.seek.is_none() { vec![0.0] } else { args.at.clone() };
    for t in times {
        // Headless run: decode up front so the printed frame is exact
        engine.ensure_decoded_up_to(t)?;
        engine.render_at(t);
        if let Some(pts) = engine.shown_pts() {
            println!("frame {:.3} for {:.3}", pts, t);
        }
    }
    engine.wait_decode_idle(Duration::from_secs(2));
    print_events(&events);

    if let Some(out) = &args.snapshot {
        write_snapshot(&engine, out)?;
        println!("snapshot {}", out.display());
    }

    let stats = engine.cache_stats();
    info!(
        "Cache: {} hits, {} misses, {} evictions ({:.0}% hit rate)",
        stats.hits(),
        stats.misses(),
        stats.evictions(),
        stats.hit_rate() * 100.0
    );
    Ok(())
}
