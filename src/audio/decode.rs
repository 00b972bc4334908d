//! File decode and resample front end.
//!
//! The DSP stages assume zero-centered mono samples at a fixed 12.8 kHz.
//! Anything a container hands us gets downmixed and resampled here before
//! it reaches the pipeline.

use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::audio::spectral::SAMPLE_RATE;
use crate::error::{PipelineError, Result};

pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decode any supported container to mono f32 at its native rate.
pub fn decode_file(path: &Path) -> Result<DecodedAudio> {
    let file = std::fs::File::open(path)
        .map_err(|e| PipelineError::Decode(format!("open {}: {}", path.display(), e)))?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| PipelineError::Decode(format!("probe {}: {}", path.display(), e)))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
        .ok_or_else(|| PipelineError::Decode(format!("no audio track in {}", path.display())))?;

    let track_id = track.id;
    let channels = track.codec_params.channels.map_or(1, |c| c.count());
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| PipelineError::Decode("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| PipelineError::Decode(format!("create decoder: {}", e)))?;

    let mut all_samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(PipelineError::Decode(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // A corrupt packet is skippable; the stream continues.
            Err(symphonia::core::errors::Error::DecodeError(_)) => continue,
            Err(e) => return Err(PipelineError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        let num_frames = decoded.frames();

        let mut sample_buf = SampleBuffer::<f32>::new(num_frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let samples = sample_buf.samples();

        if channels == 1 {
            all_samples.extend_from_slice(samples);
        } else {
            for frame_samples in samples.chunks(channels) {
                let mono: f32 = frame_samples.iter().sum::<f32>() / channels as f32;
                all_samples.push(mono);
            }
        }
    }

    log::info!(
        "decoded {}: {} samples, {} Hz, {:.1}s",
        path.display(),
        all_samples.len(),
        sample_rate,
        all_samples.len() as f32 / sample_rate as f32
    );

    Ok(DecodedAudio {
        samples: all_samples,
        sample_rate,
    })
}

/// Resample mono audio to the pipeline rate with a windowed-sinc kernel.
pub fn resample_to_pipeline_rate(samples: &[f32], from_rate: u32) -> Result<Vec<f32>> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
        WindowFunction,
    };

    if from_rate == 0 {
        return Err(PipelineError::Resample("source rate is zero".into()));
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = SAMPLE_RATE as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        2.0, // max relative ratio
        params,
        samples.len(),
        1, // mono
    )
    .map_err(|e| PipelineError::Resample(e.to_string()))?;

    let input = vec![samples.to_vec()];
    let output = resampler
        .process(&input, None)
        .map_err(|e| PipelineError::Resample(e.to_string()))?;

    Ok(output.into_iter().next().unwrap_or_default())
}

/// Decode `path` and deliver samples at the pipeline rate.
pub fn load_pipeline_samples(path: &Path) -> Result<Vec<f32>> {
    let decoded = decode_file(path)?;
    if decoded.sample_rate == SAMPLE_RATE {
        return Ok(decoded.samples);
    }
    log::debug!("resampling {} Hz -> {} Hz", decoded.sample_rate, SAMPLE_RATE);
    resample_to_pipeline_rate(&decoded.samples, decoded.sample_rate)
}
