//! Reference cpal-backed audio output (feature `audio-output`).
//!
//! Drives a session's [`AudioCallback`] from a real device callback: cpal
//! invokes the closure at the device's own cadence, the closure pulls exactly
//! what it needs, and silence padding inside the pull keeps the device fed
//! during underruns. Hosts with their own audio stacks implement the pull
//! loop themselves and never enable this feature.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};

use crate::media::PlaybackError;
use crate::session::AudioCallback;

/// A running output stream pulling from one session.
pub struct AudioOutput {
    /// Kept alive; audio stops when dropped.
    _stream: cpal::Stream,
    sample_rate: u32,
    channels: u16,
}

impl AudioOutput {
    /// Opens the default output device and starts pulling.
    ///
    /// `volume` is sampled once per device callback, so host volume changes
    /// apply within one callback period.
    pub fn start<V>(callback: AudioCallback, volume: V) -> Result<Self, PlaybackError>
    where
        V: Fn() -> u8 + Send + 'static,
    {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlaybackError::Io("no audio output device available".into()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::Io(format!("default output config: {e}")))?;

        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.config();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32, V>(&device, &config, callback, volume),
            SampleFormat::I16 => build_stream::<i16, V>(&device, &config, callback, volume),
            SampleFormat::U16 => build_stream::<u16, V>(&device, &config, callback, volume),
            other => Err(PlaybackError::Io(format!(
                "unsupported output sample format: {other:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| PlaybackError::Io(format!("start output stream: {e}")))?;
        tracing::info!("audio output started ({sample_rate} Hz, {channels} ch)");

        Ok(Self {
            _stream: stream,
            sample_rate,
            channels,
        })
    }

    /// Device sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Device channel count.
    pub fn channels(&self) -> u16 {
        self.channels
    }
}

fn build_stream<T, V>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut callback: AudioCallback,
    volume: V,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32>,
    V: Fn() -> u8 + Send + 'static,
{
    let mut scratch: Vec<u8> = Vec::new();
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let bytes = data.len() * 2;
                if scratch.len() < bytes {
                    scratch.resize(bytes, 0);
                }
                callback.pull(&mut scratch[..bytes], volume());
                for (out, pair) in data.iter_mut().zip(scratch.chunks_exact(2)) {
                    let sample = i16::from_le_bytes([pair[0], pair[1]]);
                    *out = T::from_sample(f32::from(sample) / 32_768.0);
                }
            },
            |err| tracing::error!("cpal audio error: {err}"),
            None,
        )
        .map_err(|e| PlaybackError::Io(format!("build output stream: {e}")))?;
    Ok(stream)
}
