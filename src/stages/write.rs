//! Write stage: persists selected frames as PPM files.

use std::fs::{self, File};
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr};
use metrics::counter;

use crate::logger;
use crate::pipeline::{Frame, FramePipeline, QueueId};
use crate::service::{Service, Stage};

pub const DEFAULT_OUTPUT_DIRECTORY: &str = "output";
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WriteStage {
    /// Where selected frames arrive: `Selected`, or `Blurred` when the blur
    /// stage sits in between.
    source: QueueId,
    output_directory: PathBuf,
    /// The drain receive doubles as the graceful shutdown drain, so this is
    /// deliberately generous.
    drain_timeout: Duration,
    frame_number: u32,
}

impl WriteStage {
    pub fn new(source: QueueId, output_directory: impl Into<PathBuf>) -> Self {
        Self {
            source,
            output_directory: output_directory.into(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            frame_number: 0,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    fn output_path(&self) -> PathBuf {
        self.output_directory
            .join(format!("{:06}.ppm", self.frame_number))
    }
}

fn write_ppm(path: &Path, frame: &Frame) -> Result<()> {
    let file = File::create(path)
        .wrap_err_with(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write!(writer, "P6\n{} {}\n255\n", frame.width(), frame.height())?;
    writer.write_all(&frame.pixels)?;
    writer.flush()?;
    Ok(())
}

impl Stage for WriteStage {
    /// Make sure the output directory exists and start from a clean slate.
    fn setup(&mut self, _pipeline: &FramePipeline) -> Result<()> {
        fs::create_dir_all(&self.output_directory)
            .wrap_err_with(|| format!("creating {}", self.output_directory.display()))?;
        for entry in fs::read_dir(&self.output_directory)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        self.frame_number = 0;
        Ok(())
    }

    /// Drain everything waiting, then idle out. Written frames are consumed:
    /// their tokens never return to the pool.
    fn work(&mut self, pipeline: &FramePipeline, service: &Service, _request: u64) -> Result<()> {
        while let Some(token) = pipeline.recv_timeout(self.source, self.drain_timeout)? {
            let path = self.output_path();
            {
                let frame = pipeline.frame(token);
                write_ppm(&path, &frame)?;
            }
            pipeline.consume(token);
            logger::write(
                service.priority_descending(),
                format_args!("wrote {}", path.display()),
            );
            counter!("frames_written").increment(1);
            self.frame_number += 1;
        }
        Ok(())
    }

    fn teardown(&mut self, _pipeline: &FramePipeline) -> Result<()> {
        logger::write(
            0,
            format_args!("write complete after {} files", self.frame_number),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FrameToken, PipelineConfig};
    use crate::service::ServiceSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn scratch_dir() -> PathBuf {
        let index = DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "realtimely_write_test_{}_{index}",
            std::process::id()
        ))
    }

    fn pipeline() -> FramePipeline {
        FramePipeline::new(PipelineConfig {
            frame_count: 3,
            width: 2,
            height: 2,
            blur: false,
        })
        .unwrap()
    }

    fn service() -> Service {
        Service::new(
            ServiceSpec {
                id: 4,
                name: "Write Frame".into(),
                period: 3,
                cpu: 0,
            },
            1,
        )
    }

    #[test]
    fn ppm_bytes_are_well_formed() {
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        let mut frame = Frame::new(2, 2);
        frame.pixels.copy_from_slice(&[
            255, 0, 0, 0, 255, 0, //
            0, 0, 255, 9, 9, 9,
        ]);
        let path = dir.join("000000.ppm");
        write_ppm(&path, &frame).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"P6\n2 2\n255\n"));
        assert_eq!(&bytes[b"P6\n2 2\n255\n".len()..], frame.pixels.as_slice());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn setup_clears_previous_output() {
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("leftover.ppm"), b"stale").unwrap();

        let pipeline = pipeline();
        let mut stage = WriteStage::new(QueueId::Selected, &dir);
        stage.setup(&pipeline).unwrap();

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn drains_everything_and_consumes_tokens() {
        let dir = scratch_dir();
        let pipeline = pipeline();
        let mut stage = WriteStage::new(QueueId::Selected, &dir)
            .with_drain_timeout(Duration::from_millis(20));
        let service = service();
        stage.setup(&pipeline).unwrap();

        for index in 0..2 {
            pipeline
                .send(QueueId::Selected, FrameToken::new(index))
                .unwrap();
        }
        stage.work(&pipeline, &service, 1).unwrap();

        let mut names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["000000.ppm", "000001.ppm"]);
        assert_eq!(pipeline.consumed_count(), 2);
        assert_eq!(pipeline.queue_len(QueueId::Available), 0);
        fs::remove_dir_all(&dir).unwrap();
    }
}
