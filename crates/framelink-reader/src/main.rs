//! framelink frame reader
//!
//! Attaches to a frame ring exported by the agent and prints what arrives.
//! Uses only the shared-memory contract; no connection to the host process.

use clap::{Parser, Subcommand};
use framelink_common::{init_host_logging, FrameData, Result, TransportStats};
use framelink_core::transport::layout::RingGeometry;
use framelink_core::SharedMemoryRingTransport;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "framelink-reader")]
#[command(about = "Read frames exported by framelink-agent over shared memory")]
#[command(version)]
struct Args {
    /// Segment name
    #[arg(short, long, global = true, default_value = "FramelinkFrames")]
    name: String,

    /// Print JSON lines instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the ring's geometry and state
    Info,

    /// Print metadata of each frame as it arrives
    Watch {
        /// Stop after this many frames (0 = run until the timeout)
        #[arg(short, long, default_value = "0")]
        count: u64,

        /// Give up after this many seconds without a frame
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Write raw frames to disk, one file per frame
    Dump {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// Frames to write
        #[arg(short, long, default_value = "1")]
        count: u64,

        /// Give up after this many seconds without a frame
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
}

#[derive(Debug, Serialize)]
struct RingInfo<'a> {
    name: &'a str,
    retained_frames: u32,
    slot_size: u32,
    total_size: usize,
    capabilities: u32,
    pending: u32,
    sequence: u64,
}

impl<'a> RingInfo<'a> {
    fn of(ring: &'a SharedMemoryRingTransport) -> Self {
        let geometry: RingGeometry = ring.geometry();
        Self {
            name: ring.name(),
            retained_frames: geometry.retained_frames(),
            slot_size: geometry.slot_size,
            total_size: geometry.total_size,
            capabilities: ring.capabilities(),
            pending: ring.pending(),
            sequence: ring.sequence(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct FrameSummary {
    sequence: u64,
    timestamp: u64,
    width: u32,
    height: u32,
    stride: u32,
    format: String,
    bytes: usize,
}

impl From<&FrameData> for FrameSummary {
    fn from(frame: &FrameData) -> Self {
        Self {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            width: frame.width,
            height: frame.height,
            stride: frame.stride,
            format: frame.format.to_string(),
            bytes: frame.data.len(),
        }
    }
}

fn print_line<T: Serialize + std::fmt::Debug>(value: &T, json: bool) {
    if json {
        match serde_json::to_string(value) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("serialization failed: {}", e),
        }
    } else {
        println!("{:?}", value);
    }
}

/// Pull frames until `count` arrived (0 = unlimited) or `idle` passes
/// without one. Returns the number handled.
fn for_each_frame(
    ring: &SharedMemoryRingTransport,
    count: u64,
    idle: Duration,
    mut handle: impl FnMut(&FrameData) -> Result<()>,
) -> Result<u64> {
    let mut frame = FrameData::default();
    let mut handled = 0;
    let mut last = Instant::now();

    while count == 0 || handled < count {
        if ring.read_frame_into(&mut frame)? {
            handle(&frame)?;
            handled += 1;
            last = Instant::now();
            continue;
        }
        let waited = last.elapsed();
        if waited >= idle {
            info!(
                target: "framelink_reader",
                handled,
                idle_secs = idle.as_secs_f32(),
                "No frame arrived in time, stopping"
            );
            break;
        }
        ring.wait_for_frame((idle - waited).min(Duration::from_millis(250)));
    }
    Ok(handled)
}

fn dump_path(dir: &Path, frame: &FrameData) -> PathBuf {
    dir.join(format!(
        "frame-{:08}-{}x{}-{}.raw",
        frame.sequence,
        frame.width,
        frame.height,
        frame.format.name().to_lowercase()
    ))
}

fn dump(ring: &SharedMemoryRingTransport, out: &Path, count: u64, idle: Duration) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out)?;
    let mut written = Vec::new();
    for_each_frame(ring, count, idle, |frame| {
        let path = dump_path(out, frame);
        std::fs::write(&path, &frame.data)?;
        debug!(
            target: "framelink_reader",
            sequence = frame.sequence,
            path = %path.display(),
            "Frame written"
        );
        written.push(path);
        Ok(())
    })?;
    Ok(written)
}

fn print_stats(stats: &TransportStats, json: bool) {
    if json {
        print_line(stats, true);
    } else {
        eprintln!("frames read: {}", stats.frames_read);
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_host_logging();
    let args = Args::parse();

    let ring = match SharedMemoryRingTransport::open(&args.name) {
        Ok(ring) => ring,
        Err(e) => {
            error!(
                target: "framelink_reader",
                name = %args.name,
                error = %e,
                "Cannot attach to frame ring"
            );
            return Err(e.into());
        }
    };
    debug!(
        target: "framelink_reader",
        name = %args.name,
        slots = ring.capacity(),
        pending = ring.pending(),
        "Attached to frame ring"
    );

    match args.command {
        Command::Info => print_line(&RingInfo::of(&ring), args.json),
        Command::Watch { count, timeout } => {
            let json = args.json;
            for_each_frame(&ring, count, Duration::from_secs(timeout), |frame| {
                print_line(&FrameSummary::from(frame), json);
                Ok(())
            })?;
            print_stats(&ring.stats(), json);
        }
        Command::Dump {
            out,
            count,
            timeout,
        } => {
            for path in dump(&ring, &out, count, Duration::from_secs(timeout))? {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}
