//! CLI command implementations

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use tracing::info;
use undertow_core::{TorrentSpec, UndertowConfig, UndertowError};
use undertow_sim::{SimulatedContent, SimulatedSession, SimulationConfig};

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;

/// Cache options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Cache capacity in MiB (0 = three times the readahead)
    #[arg(long, global = true)]
    pub cache_size: Option<u64>,
    /// Store pieces as files instead of memory buffers
    #[arg(long, global = true)]
    pub disk: bool,
    /// Directory for disk-backed pieces
    #[arg(long, global = true)]
    pub save_path: Option<PathBuf>,
}

impl CacheArgs {
    /// Environment configuration with command-line overrides applied.
    ///
    /// # Errors
    /// - Resulting settings are rejected by validation
    pub fn config(&self) -> Result<UndertowConfig> {
        let mut config = UndertowConfig::from_env();
        if let Some(size) = self.cache_size {
            config.cache.cache_size = size * MIB;
        }
        if self.disk {
            config.cache.use_disk = true;
        }
        if let Some(path) = &self.save_path {
            config.cache.save_path = path.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Shape of the simulated torrent and swarm.
#[derive(Args, Debug, Clone)]
pub struct ContentArgs {
    /// Size of the simulated file in MiB
    #[arg(long, default_value = "64")]
    pub file_size: u64,
    /// Piece length in KiB
    #[arg(long, default_value = "1024")]
    pub piece_length: u64,
    /// Swarm download rate in MiB/s (0 = unthrottled)
    #[arg(long, default_value = "8")]
    pub rate: u64,
    /// Seed for generated content
    #[arg(long, default_value = "12345")]
    pub seed: u64,
}

impl ContentArgs {
    fn simulation(&self) -> SimulationConfig {
        SimulationConfig {
            download_rate_bps: self.rate * MIB,
            ..SimulationConfig::with_seed(self.seed)
        }
    }

    fn content(&self) -> Result<SimulatedContent> {
        if self.file_size == 0 || self.piece_length == 0 {
            bail!("file size and piece length must be positive");
        }
        Ok(SimulatedContent::single_file(
            "undertow-sample.mp4",
            self.file_size * MIB,
            self.piece_length * KIB,
            self.seed,
        ))
    }
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a simulated file through the cache and verify every byte
    Stream {
        #[command(flatten)]
        content: ContentArgs,
        /// Read size in KiB
        #[arg(long, default_value = "64")]
        chunk: u64,
        /// Offset in MiB to start reading from
        #[arg(long, default_value = "0")]
        start: u64,
    },
    /// Preload the head and tail of a simulated file
    Preload {
        #[command(flatten)]
        content: ContentArgs,
    },
    /// Parse a magnet link or hex info hash
    Parse {
        /// Magnet URI or 40 character info hash
        link: String,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, cache: &CacheArgs) -> Result<()> {
    match command {
        Commands::Stream {
            content,
            chunk,
            start,
        } => stream_file(cache, &content, chunk, start).await,
        Commands::Preload { content } => preload_file(cache, &content).await,
        Commands::Parse { link } => parse_link(&link),
    }
}

/// Streams the whole simulated file, comparing reads with the generated bytes.
///
/// # Errors
/// - Torrent failed to open or a read failed
/// - Any read returned bytes that differ from the source
pub async fn stream_file(
    cache_args: &CacheArgs,
    content_args: &ContentArgs,
    chunk: u64,
    start: u64,
) -> Result<()> {
    let session = SimulatedSession::new(cache_args.config()?, content_args.simulation());
    let content = session.swarm().register(content_args.content()?);
    let expected = content.file_data(0);
    println!(
        "Streaming {} ({} MiB, {} pieces of {} KiB)",
        content.info().name,
        content_args.file_size,
        content.info().piece_count,
        content_args.piece_length
    );

    let torrent = session
        .server()
        .open_torrent(TorrentSpec::new(content.info_hash()))
        .await?;
    let reader = torrent.new_reader(0)?;
    let mut offset = (start * MIB).min(expected.len() as u64) as usize;
    if offset > 0 {
        reader.seek(SeekFrom::Start(offset as u64)).await?;
    }

    let started = Instant::now();
    let mut buf = vec![0u8; (chunk.max(1) * KIB) as usize];
    let mut mismatches = 0usize;
    let mut peak_filled = 0u64;
    let report_every = (expected.len() / 10).max(1);
    let mut next_report = offset + report_every;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .with_context(|| format!("read failed at offset {offset}"))?;
        if n == 0 {
            break;
        }
        if buf[..n] != expected[offset..offset + n] {
            mismatches += 1;
        }
        offset += n;

        if let Some(cache) = torrent.cache() {
            peak_filled = peak_filled.max(cache.filled());
        }
        if offset >= next_report {
            info!(
                "{:>3}% streamed, cache {peak_filled} bytes at peak",
                offset * 100 / expected.len()
            );
            next_report = offset + report_every;
        }
    }
    torrent.close_reader(&reader).await;

    let elapsed = started.elapsed().as_secs_f64();
    let capacity = torrent.cache().map_or(0, |c| c.capacity());
    println!(
        "Read {} bytes in {elapsed:.2}s ({:.2} MiB/s)",
        offset,
        offset as f64 / MIB as f64 / elapsed.max(f64::EPSILON)
    );
    println!("Peak cache fill: {peak_filled} of {capacity} bytes");
    if let Some(state) = torrent.cache_state() {
        println!("{}", serde_json::to_string_pretty(&state)?);
    }
    session.shutdown();

    if mismatches > 0 {
        bail!("{mismatches} reads returned unexpected bytes");
    }
    Ok(())
}

/// Preloads the simulated file with the configured share of the cache.
///
/// # Errors
/// - Torrent failed to open or preload failed
pub async fn preload_file(cache_args: &CacheArgs, content_args: &ContentArgs) -> Result<()> {
    let session = SimulatedSession::new(cache_args.config()?, content_args.simulation());
    let content = session.swarm().register(content_args.content()?);

    let torrent = session
        .server()
        .open_torrent(TorrentSpec::new(content.info_hash()))
        .await?;
    let started = Instant::now();
    session.server().preload(&torrent, 0).await?;

    let status = torrent.status();
    println!(
        "Preloaded {} of {} bytes in {:.2}s",
        status.preloaded_bytes,
        status.preload_size,
        started.elapsed().as_secs_f64()
    );
    println!("{}", serde_json::to_string_pretty(&status)?);
    session.shutdown();
    Ok(())
}

/// Prints what a magnet link or info hash resolves to.
///
/// # Errors
/// - Link is neither a magnet URI nor a valid info hash
pub fn parse_link(link: &str) -> Result<()> {
    let spec = TorrentSpec::from_link(link)
        .map_err(|e| anyhow::anyhow!(UndertowError::from(e).user_message()))?;

    println!("Info hash: {}", spec.info_hash);
    if let Some(name) = &spec.display_name {
        println!("Name:      {name}");
    }
    for tracker in &spec.trackers {
        println!("Tracker:   {tracker}");
    }
    Ok(())
}
