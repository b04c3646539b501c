use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use image::{GrayImage, Luma};
use ndarray::Array2;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use skycell::cache::{CacheConfig, EvictionPolicy, ImageCache};
use skycell::filemap::CellFileTable;
use skycell::grid::GeometryTable;
use skycell::grid::builder::{GridConfig, build_grid};
use skycell::resolver::SkycellResolver;
use skycell::sampler::TileSampler;

#[derive(Parser)]
#[command(name = "skycell", about = "Resolve sky positions to survey skycell pixels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a ring tessellation and write it as a binary table.
    BuildGrid {
        /// Output path for the geometry table.
        #[arg(short, long)]
        output: PathBuf,

        /// Declination height of each ring in degrees.
        #[arg(long, default_value = "4.0")]
        ring_height: f64,

        /// Lowest declination to cover, in degrees.
        #[arg(long, default_value = "-30.0", allow_hyphen_values = true)]
        dec_floor: f64,

        /// Border pad around each sub-image in pixels.
        #[arg(long, default_value = "480")]
        pad: u32,

        /// Id of the first cell in the lowest ring.
        #[arg(long, default_value = "1")]
        first_cell: u32,
    },

    /// Print the cell, sub-cell and pixel covering a sky position.
    Locate {
        /// Path to the geometry table.
        #[arg(short, long)]
        grid: PathBuf,

        /// Right ascension in degrees.
        #[arg(allow_hyphen_values = true)]
        ra: f64,

        /// Declination in degrees.
        #[arg(allow_hyphen_values = true)]
        dec: f64,
    },

    /// Print the sky position of a sub-cell image centre.
    Center {
        /// Path to the geometry table.
        #[arg(short, long)]
        grid: PathBuf,

        cell: u32,

        subcell: u8,
    },

    /// Build a cell-to-file table from survey images in a directory.
    ScanFiles {
        /// Directory containing skycell images.
        dir: PathBuf,

        /// Glob pattern for image files within the directory.
        #[arg(long, default_value = "*.fits")]
        pattern: String,

        /// Output path for the cell-to-file table.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Sample an RA/Dec box into a grayscale PNG (north up, east left).
    Sample {
        /// Path to the geometry table.
        #[arg(short, long)]
        grid: PathBuf,

        /// Path to the cell-to-file table.
        #[arg(short, long)]
        files: PathBuf,

        /// RA range in degrees (e.g. "210.5,215.8").
        #[arg(long, allow_hyphen_values = true)]
        ra_range: String,

        /// Dec range in degrees (e.g. "-1.0,2.5").
        #[arg(long, allow_hyphen_values = true)]
        dec_range: String,

        /// Output width in pixels.
        #[arg(long, default_value = "256")]
        width: usize,

        /// Output height in pixels.
        #[arg(long, default_value = "256")]
        height: usize,

        /// Number of decoded images kept in memory.
        #[arg(long, default_value = "10")]
        cache: usize,

        /// Evict the least recently used image instead of the oldest.
        #[arg(long)]
        lru: bool,

        /// Output PNG path.
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn load_grid(path: &Path) -> GeometryTable {
    GeometryTable::load(path).unwrap_or_else(|e| {
        error!("Failed to load geometry table {}: {e}", path.display());
        process::exit(1);
    })
}

fn parse_range(name: &str, s: &str) -> (f64, f64) {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 2 {
        error!("{name} must be two comma-separated values (e.g. \"210.5,215.8\")");
        process::exit(1);
    }
    let bound = |part: &str| {
        part.trim().parse::<f64>().unwrap_or_else(|_| {
            error!("Invalid {name} bound: {part}");
            process::exit(1);
        })
    };
    (bound(parts[0]), bound(parts[1]))
}

fn cmd_build_grid(output: &Path, config: &GridConfig) {
    let table = build_grid(config).unwrap_or_else(|e| {
        error!("Failed to build grid: {e}");
        process::exit(1);
    });
    info!(
        rings = table.len(),
        cells = table.cell_id_end() - config.first_cell_id,
        dec_floor = table.dec_floor().to_degrees(),
        "built geometry table"
    );
    table.save(output).unwrap_or_else(|e| {
        error!("Failed to save geometry table {}: {e}", output.display());
        process::exit(1);
    });
    info!("Saved geometry table to {}", output.display());
}

fn cmd_locate(grid: &Path, ra: f64, dec: f64) {
    let resolver = SkycellResolver::new(load_grid(grid));
    let p = resolver.resolve_one(ra.to_radians(), dec.to_radians());
    if !p.is_covered() {
        println!("RA={ra:.6} Dec={dec:+.6} is not covered");
        process::exit(1);
    }
    println!(
        "skycell.{:04}.{:03}  x={} y={}  (cell centre RA={:.6} Dec={:+.6})",
        p.cell_id,
        p.subcell_id,
        p.pixel_x,
        p.pixel_y,
        p.ref_sky[0].to_degrees(),
        p.ref_sky[1].to_degrees(),
    );
}

fn cmd_center(grid: &Path, cell: u32, subcell: u8) {
    let resolver = SkycellResolver::new(load_grid(grid));
    let (ra, dec) = resolver.cell_center(cell, subcell);
    println!(
        "skycell.{cell:04}.{subcell:03}  RA={:.6} Dec={:+.6}",
        ra.to_degrees(),
        dec.to_degrees()
    );
}

fn cmd_scan_files(dir: &Path, pattern: &str, output: &Path) {
    let table = CellFileTable::scan(dir, pattern).unwrap_or_else(|e| {
        error!("Failed to scan {}: {e}", dir.display());
        process::exit(1);
    });
    if table.is_empty() {
        error!("No skycell images matched '{}'", dir.join(pattern).display());
        process::exit(1);
    }
    table.save(output).unwrap_or_else(|e| {
        error!("Failed to write {}: {e}", output.display());
        process::exit(1);
    });
    info!("Wrote {} entries to {}", table.len(), output.display());
}

/// Sky grid for an output image: row 0 is the northern edge and RA
/// decreases to the right.
fn sky_grid(ra: (f64, f64), dec: (f64, f64), width: usize, height: usize) -> (Array2<f64>, Array2<f64>) {
    let (ra_lo, ra_hi) = (ra.0.min(ra.1), ra.0.max(ra.1));
    let (dec_lo, dec_hi) = (dec.0.min(dec.1), dec.0.max(dec.1));
    let ra_grid = Array2::from_shape_fn((height, width), |(_, c)| {
        let t = (c as f64 + 0.5) / width as f64;
        (ra_hi - (ra_hi - ra_lo) * t).to_radians()
    });
    let dec_grid = Array2::from_shape_fn((height, width), |(r, _)| {
        let t = (r as f64 + 0.5) / height as f64;
        (dec_hi - (dec_hi - dec_lo) * t).to_radians()
    });
    (ra_grid, dec_grid)
}

#[allow(clippy::too_many_arguments)]
fn cmd_sample(
    grid: &Path,
    files: &Path,
    ra_range: (f64, f64),
    dec_range: (f64, f64),
    width: usize,
    height: usize,
    cache_config: CacheConfig,
    output: &Path,
) {
    let resolver = SkycellResolver::new(load_grid(grid));
    let table = CellFileTable::load(files).unwrap_or_else(|e| {
        error!("Failed to load cell-to-file table {}: {e}", files.display());
        process::exit(1);
    });
    let cache = ImageCache::new(cache_config).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });
    let mut sampler = TileSampler::new(resolver, table, cache);
    info!(
        rings = sampler.resolver().table().len(),
        entries = sampler.files().len(),
        sources = sampler.files().paths().len(),
        policy = ?sampler.cache().policy(),
        "Sampling {width}x{height} tile"
    );

    let (ra, dec) = sky_grid(ra_range, dec_range, width, height);
    let tile = match sampler.sample(&ra, &dec) {
        Ok(Some(tile)) => tile,
        Ok(None) => {
            error!("No registered survey image covers the requested region");
            process::exit(1);
        }
        Err(e) => {
            error!("Sampling failed: {e}");
            process::exit(1);
        }
    };

    let img = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([tile[[y as usize, x as usize]]])
    });
    img.save(output).unwrap_or_else(|e| {
        error!("Failed to write {}: {e}", output.display());
        process::exit(1);
    });
    info!(
        cached = sampler.cache().len(),
        "Wrote {width}x{height} tile to {}",
        output.display()
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::BuildGrid {
            output,
            ring_height,
            dec_floor,
            pad,
            first_cell,
        } => {
            let config = GridConfig {
                ring_height: ring_height.to_radians(),
                dec_floor: dec_floor.to_radians(),
                pad_px: *pad,
                first_cell_id: *first_cell,
                ..GridConfig::default()
            };
            cmd_build_grid(output, &config);
        }
        Commands::Locate { grid, ra, dec } => cmd_locate(grid, *ra, *dec),
        Commands::Center {
            grid,
            cell,
            subcell,
        } => cmd_center(grid, *cell, *subcell),
        Commands::ScanFiles {
            dir,
            pattern,
            output,
        } => cmd_scan_files(dir, pattern, output),
        Commands::Sample {
            grid,
            files,
            ra_range,
            dec_range,
            width,
            height,
            cache,
            lru,
            output,
        } => {
            if *width == 0 || *height == 0 {
                error!("Output size must be positive");
                process::exit(1);
            }
            let cache_config = CacheConfig {
                capacity: *cache,
                policy: if *lru {
                    EvictionPolicy::Lru
                } else {
                    EvictionPolicy::Fifo
                },
                ..CacheConfig::default()
            };
            cmd_sample(
                grid,
                files,
                parse_range("ra-range", ra_range),
                parse_range("dec-range", dec_range),
                *width,
                *height,
                cache_config,
                output,
            );
        }
    }
}
