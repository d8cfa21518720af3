//! Offline Export
//!
//! Renders a timeline range block by block through the non-realtime mixing
//! path and writes the master bus to a WAV file:
//! - 16/24-bit PCM or 32-bit float
//! - Optional peak normalization (two passes: measure, then write)
//! - Progress reported only when the percentage increases

use std::path::PathBuf;

use tl_core::{Decibels, ExportDefaults, SampleFormat, TimeRef, TlError, TlResult};
use tl_file::WavFileWriter;

use crate::bus::AudioBus;
use crate::track::PROCESS_BUS_CHANNELS;

// ═══════════════════════════════════════════════════════════════════════════
// EXPORT SPEC
// ═══════════════════════════════════════════════════════════════════════════

/// Output file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    Wav16,
    #[default]
    Wav24,
    WavFloat,
}

impl ExportFormat {
    pub fn sample_format(self) -> SampleFormat {
        match self {
            ExportFormat::Wav16 => SampleFormat::Int16,
            ExportFormat::Wav24 => SampleFormat::Int24,
            ExportFormat::WavFloat => SampleFormat::Float32,
        }
    }
}

impl From<SampleFormat> for ExportFormat {
    fn from(format: SampleFormat) -> Self {
        match format {
            SampleFormat::Int16 => ExportFormat::Wav16,
            SampleFormat::Int24 => ExportFormat::Wav24,
            SampleFormat::Float32 => ExportFormat::WavFloat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPass {
    /// Measure the peak, write nothing
    CalcNormFactor,
    WriteToHardDisk,
}

#[derive(Debug, Clone)]
pub struct ExportSpec {
    pub path: PathBuf,
    pub format: ExportFormat,
    pub channels: usize,
    pub sample_rate: u32,
    pub block_size: usize,
    /// Derived from the tracks when not given
    pub start: Option<TimeRef>,
    pub end: Option<TimeRef>,
    pub normalize: bool,
    pub normalize_target_db: f32,
    /// Gain applied while writing
    pub normvalue: f32,
    /// Largest absolute sample of the last pass
    pub peakvalue: f32,
    pub render_pass: RenderPass,
    pub progress: u32,
}

impl ExportSpec {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self::with_defaults(path, sample_rate, &ExportDefaults::default())
    }

    pub fn with_defaults(path: impl Into<PathBuf>, sample_rate: u32, defaults: &ExportDefaults) -> Self {
        Self {
            path: path.into(),
            format: defaults.format.into(),
            channels: PROCESS_BUS_CHANNELS,
            sample_rate,
            block_size: defaults.block_size.max(1),
            start: None,
            end: None,
            normalize: false,
            normalize_target_db: defaults.normalize_target_db,
            normvalue: 1.0,
            peakvalue: 0.0,
            render_pass: RenderPass::WriteToHardDisk,
            progress: 0,
        }
    }

    pub fn with_range(mut self, start: TimeRef, end: TimeRef) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    fn range(&self) -> TlResult<(TimeRef, TimeRef)> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(TlError::Export("export range not set".to_string())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RENDER LOOP
// ═══════════════════════════════════════════════════════════════════════════

/// Check the spec before any work is done
pub fn validate(spec: &ExportSpec) -> TlResult<()> {
    if spec.channels == 0 {
        return Err(TlError::Export("export needs at least one channel".to_string()));
    }
    if spec.sample_rate == 0 {
        return Err(TlError::InvalidSampleRate(0));
    }
    let (start, end) = spec.range()?;
    if start == end {
        return Err(TlError::Export("No audio to export".to_string()));
    }
    if start > end {
        return Err(TlError::Export(format!("export start {} is after end {}", start, end)));
    }
    Ok(())
}

/// Render `spec`'s range. `process` fills the master bus for
/// `(location, nframes)`; `on_progress` receives increasing percentages.
pub fn render<F, P>(spec: &mut ExportSpec, mut process: F, mut on_progress: P) -> TlResult<()>
where
    F: FnMut(TimeRef, usize, &mut AudioBus),
    P: FnMut(u32),
{
    validate(spec)?;
    let (start, end) = spec.range()?;
    let total = (end.to_frame(spec.sample_rate) - start.to_frame(spec.sample_rate)).max(0) as u64;

    let mut master = AudioBus::new(PROCESS_BUS_CHANNELS, spec.block_size);
    let mut interleaved = vec![0.0f32; spec.block_size * spec.channels];
    spec.normvalue = 1.0;
    spec.peakvalue = 0.0;
    spec.progress = 0;

    let passes = if spec.normalize { 2 } else { 1 };
    if spec.normalize {
        spec.render_pass = RenderPass::CalcNormFactor;
        run_pass(spec, start, total, 0, passes, &mut master, &mut interleaved, None, &mut process, &mut on_progress)?;

        if spec.peakvalue > 0.0 {
            let mut target = Decibels(spec.normalize_target_db as f64).to_gain() as f32;
            if target >= 1.0 {
                target = 1.0 - f32::EPSILON;
            }
            spec.normvalue = target / spec.peakvalue;
        }
        log::info!(
            "[Export] peak {:.4}, normalization gain {:.4}",
            spec.peakvalue,
            spec.normvalue
        );
        spec.peakvalue = 0.0;
    }

    spec.render_pass = RenderPass::WriteToHardDisk;
    let mut writer = WavFileWriter::create(&spec.path, spec.channels, spec.sample_rate, spec.format.sample_format())?;
    run_pass(
        spec,
        start,
        total,
        passes - 1,
        passes,
        &mut master,
        &mut interleaved,
        Some(&mut writer),
        &mut process,
        &mut on_progress,
    )?;
    writer.finalize()?;

    log::info!(
        "[Export] wrote {} ({} frames, {} ch)",
        spec.path.display(),
        writer.frames_written(),
        spec.channels
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_pass<F, P>(
    spec: &mut ExportSpec,
    start: TimeRef,
    total: u64,
    pass: u64,
    passes: u64,
    master: &mut AudioBus,
    interleaved: &mut [f32],
    mut writer: Option<&mut WavFileWriter>,
    process: &mut F,
    on_progress: &mut P,
) -> TlResult<()>
where
    F: FnMut(TimeRef, usize, &mut AudioBus),
    P: FnMut(u32),
{
    let channels = spec.channels;
    let mut done = 0u64;
    let mut location = start;

    while done < total {
        let nframes = (total - done).min(spec.block_size as u64) as usize;
        master.silence(nframes);
        process(location, nframes, master);

        let last = master.channel_count().saturating_sub(1);
        for i in 0..nframes {
            for c in 0..channels {
                let value = master.channel(c.min(last))[i] * spec.normvalue;
                spec.peakvalue = spec.peakvalue.max(value.abs());
                interleaved[i * channels + c] = value;
            }
        }

        if let Some(writer) = writer.as_deref_mut() {
            writer.write(&interleaved[..nframes * channels], nframes)?;
        }

        done += nframes as u64;
        location = location.add_frames(nframes as i64, spec.sample_rate);

        let percent = ((pass * total + done) * 100 / (passes * total)) as u32;
        if percent > spec.progress {
            spec.progress = percent;
            on_progress(percent);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tl_file::{open_reader, AudioReader};

    fn constant(value: f32) -> impl FnMut(TimeRef, usize, &mut AudioBus) {
        move |_, n, bus| {
            for ch in 0..bus.channel_count() {
                bus.channel_mut(ch)[..n].fill(value);
            }
        }
    }

    #[test]
    fn test_empty_range_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = ExportSpec::new(dir.path().join("x.wav"), 48000).with_range(TimeRef::ZERO, TimeRef::ZERO);
        let err = render(&mut spec, constant(0.5), |_| {}).unwrap_err();
        assert!(err.to_string().contains("No audio to export"));
        assert!(!dir.path().join("x.wav").exists());
    }

    #[test]
    fn test_plain_export_writes_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.wav");
        let mut spec = ExportSpec::new(&path, 48000).with_range(TimeRef::ZERO, TimeRef::from_frames(2500, 48000));
        spec.format = ExportFormat::WavFloat;
        spec.block_size = 1024;

        let mut reports = Vec::new();
        render(&mut spec, constant(0.25), |p| reports.push(p)).unwrap();
        assert_eq!(reports.last(), Some(&100));
        assert!(reports.windows(2).all(|w| w[0] < w[1]));

        let mut reader = open_reader(&path).unwrap();
        assert_eq!(reader.num_frames(), 2500);
        assert_eq!(reader.channels(), 2);
        let mut buf = vec![0.0f32; 8];
        reader.read(&mut buf, 4);
        assert!(buf.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_normalized_export_peaks_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("norm.wav");
        let mut spec = ExportSpec::new(&path, 44100)
            .with_range(TimeRef::ZERO, TimeRef::from_frames(1000, 44100))
            .with_normalize(true);
        spec.format = ExportFormat::WavFloat;
        spec.channels = 1;

        render(&mut spec, constant(0.25), |_| {}).unwrap();
        assert_relative_eq!(spec.normvalue, 4.0, epsilon = 1e-5);
        assert_relative_eq!(spec.peakvalue, 1.0, epsilon = 1e-5);
        assert_eq!(spec.render_pass, RenderPass::WriteToHardDisk);

        let mut reader = open_reader(&path).unwrap();
        let mut buf = vec![0.0f32; 10];
        reader.read(&mut buf, 10);
        assert_relative_eq!(buf[5], 1.0, epsilon = 1e-5);
    }
}
