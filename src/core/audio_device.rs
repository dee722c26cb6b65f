//! Real output device sink (cpal), behind the `audio-device` feature.
//!
//! The cpal stream is created and owned by a dedicated thread; the sink talks
//! to it over a channel, so the sink itself stays `Send` on every platform.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, warn};
use std::thread;

use super::audio::{AudioSink, SinkShared};
use crate::error::{EngineError, Result};

enum DeviceCommand {
    Play,
    Pause,
    Stop,
}

/// Default output device of the default host
pub struct CpalSink {
    name: String,
    sample_rate: u32,
    channels: u16,
    format: SampleFormat,
    commands: Option<Sender<DeviceCommand>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalSink {
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| EngineError::Audio("No audio output device available".to_string()))?;
        let config = device
            .default_output_config()
            .map_err(|e| EngineError::Audio(format!("Failed to get default output config: {}", e)))?;
        let name = device.name().unwrap_or_else(|_| "default".to_string());
        debug!(
            "Output device {}: {}Hz {}ch {:?}",
            name,
            config.sample_rate().0,
            config.channels(),
            config.sample_format()
        );
        Ok(Self {
            name,
            sample_rate: config.sample_rate().0,
            channels: config.channels().max(1),
            format: config.sample_format(),
            commands: None,
            thread: None,
        })
    }

    fn send(&self, command: DeviceCommand) -> Result<()> {
        match &self.commands {
            Some(tx) => tx
                .send(command)
                .map_err(|_| EngineError::Audio("Audio device thread is gone".to_string())),
            None => Ok(()),
        }
    }
}

impl AudioSink for CpalSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, shared: SinkShared) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let (tx, rx) = bounded(8);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let config = cpal::StreamConfig {
            channels: self.channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let format = self.format;

        let handle = thread::Builder::new()
            .name("cuepoint-audio-device".to_string())
            .spawn(move || run_device(config, format, shared, rx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.commands = Some(tx);
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(EngineError::Audio("Audio device thread exited during start".to_string())),
        }
    }

    fn set_playing(&mut self, playing: bool) -> Result<()> {
        self.send(if playing { DeviceCommand::Play } else { DeviceCommand::Pause })
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        let _ = self.send(DeviceCommand::Stop);
        self.commands = None;
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run_device(
    config: cpal::StreamConfig,
    format: SampleFormat,
    shared: SinkShared,
    commands: Receiver<DeviceCommand>,
    ready: Sender<Result<()>>,
) {
    let stream = match build_stream(&config, format, shared) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while let Ok(command) = commands.recv() {
        let result = match command {
            DeviceCommand::Play => stream.play(),
            // Not every backend can pause; the clock flag silences the callback anyway
            DeviceCommand::Pause => stream.pause(),
            DeviceCommand::Stop => break,
        };
        if let Err(e) = result {
            warn!("Audio device command failed: {}", e);
        }
    }
    debug!("Audio device thread stopped");
}

fn build_stream(config: &cpal::StreamConfig, format: SampleFormat, shared: SinkShared) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| EngineError::Audio("No audio output device available".to_string()))?;
    match format {
        SampleFormat::F32 => build_typed::<f32>(&device, config, shared),
        SampleFormat::I16 => build_typed::<i16>(&device, config, shared),
        SampleFormat::U16 => build_typed::<u16>(&device, config, shared),
        SampleFormat::I32 => build_typed::<i32>(&device, config, shared),
        other => Err(EngineError::Audio(format!("Unsupported output sample format: {:?}", other))),
    }
}

fn build_typed<T>(device: &cpal::Device, config: &cpal::StreamConfig, shared: SinkShared) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut stereo: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                stereo.resize(frames * 2, 0.0);
                shared.fill(&mut stereo);
                for (out, lr) in data.chunks_exact_mut(channels).zip(stereo.chunks_exact(2)) {
                    spread_stereo(lr[0], lr[1], out);
                }
            },
            |e| error!("Audio stream error: {}", e),
            None,
        )
        .map_err(|e| EngineError::Audio(format!("Failed to build output stream: {}", e)))
}

/// Stereo frame -> device frame (mono downmix, silence on extra channels)
fn spread_stereo<T: FromSample<f32>>(left: f32, right: f32, out: &mut [T]) {
    match out.len() {
        0 => {}
        1 => out[0] = T::from_sample((left + right) * 0.5),
        _ => {
            out[0] = T::from_sample(left);
            out[1] = T::from_sample(right);
            for extra in &mut out[2..] {
                *extra = T::from_sample(0.0f32);
            }
        }
    }
}
