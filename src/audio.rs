//! Audio device boundary. This crate never enumerates or opens devices
//! itself -- the host supplies a capture and playback implementation of
//! these traits, built on whatever device library it already uses.

/// Blocking mono PCM16 capture at a fixed device sample rate.
pub trait AudioSource: Send {
    /// Block until at least `samples` frames are available (or the device
    /// delivers a smaller ready chunk) and return them.
    fn read(&mut self, samples: usize) -> std::io::Result<Vec<i16>>;
}

/// Blocking mono PCM16 playback at a fixed device sample rate.
pub trait AudioSink: Send {
    fn write(&mut self, samples: &[i16]) -> std::io::Result<()>;
}

#[cfg(feature = "cpal-device")]
pub mod cpal_device {
    use super::{AudioSink, AudioSource};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Stream, StreamConfig};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    /// Captures from the default input device at `sample_rate`, delivering
    /// chunks through an internal channel that `read` drains and blocks on.
    pub struct CpalSource {
        _stream: Stream,
        rx: mpsc::Receiver<Vec<i16>>,
    }

    impl CpalSource {
        pub fn default_device(sample_rate: u32) -> Result<Self, String> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| "no default input device available".to_string())?;

            let config = StreamConfig {
                channels: 1,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let (tx, rx) = mpsc::channel();
            let err_fn = |err| tracing::warn!("audio input stream error: {err}");

            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _| {
                        let _ = tx.send(data.to_vec());
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| format!("failed to build input stream: {e}"))?;

            stream.play().map_err(|e| format!("failed to start input stream: {e}"))?;

            Ok(Self { _stream: stream, rx })
        }
    }

    impl AudioSource for CpalSource {
        fn read(&mut self, _samples: usize) -> std::io::Result<Vec<i16>> {
            self.rx
                .recv()
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "input stream closed"))
        }
    }

    /// Plays into the default output device at `sample_rate`, buffering
    /// writes until the device's output callback drains them.
    pub struct CpalSink {
        _stream: Stream,
        buffer: Arc<Mutex<Vec<i16>>>,
    }

    impl CpalSink {
        pub fn default_device(sample_rate: u32) -> Result<Self, String> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| "no default output device available".to_string())?;

            let config = StreamConfig {
                channels: 1,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let buffer = Arc::new(Mutex::new(Vec::<i16>::new()));
            let buffer_cb = buffer.clone();
            let err_fn = |err| tracing::warn!("audio output stream error: {err}");

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [i16], _| {
                        let mut buf = buffer_cb.lock().unwrap();
                        let available = buf.len().min(data.len());
                        data[..available].copy_from_slice(&buf[..available]);
                        buf.drain(..available);
                        if available < data.len() {
                            data[available..].fill(0);
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| format!("failed to build output stream: {e}"))?;

            stream.play().map_err(|e| format!("failed to start output stream: {e}"))?;

            Ok(Self { _stream: stream, buffer })
        }
    }

    impl AudioSink for CpalSink {
        fn write(&mut self, samples: &[i16]) -> std::io::Result<()> {
            self.buffer.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SilentSource;
    impl AudioSource for SilentSource {
        fn read(&mut self, samples: usize) -> std::io::Result<Vec<i16>> {
            Ok(vec![0i16; samples])
        }
    }

    #[test]
    fn trait_object_is_usable_behind_a_box() {
        let mut source: Box<dyn AudioSource> = Box::new(SilentSource);
        let chunk = source.read(160).unwrap();
        assert_eq!(chunk.len(), 160);
    }
}
