use clap::{Args, Parser, Subcommand};
use region_store::{
    LocalIndex, RegionFile, RegionFileConfig, RegionPos, RegionStoreConfig, StoreError,
};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "region-inspect",
    about = "Inspect block-allocated region files"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List present entries with their chunk coordinates and block runs
    Entries {
        /// Region file path
        #[arg(long, short)]
        input: PathBuf,
        #[command(flatten)]
        geometry: GeometryArgs,
    },
    /// Summarize block usage
    Stats {
        /// Region file path
        #[arg(long, short)]
        input: PathBuf,
        #[command(flatten)]
        geometry: GeometryArgs,
    },
    /// Write one entry's bytes to a file or stdout
    Dump {
        /// Region file path
        #[arg(long, short)]
        input: PathBuf,
        /// Local chunk index inside the region
        #[arg(long, conflicts_with = "local")]
        index: Option<usize>,
        /// Local chunk coordinate inside the region (3 integers: X Y Z)
        #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"])]
        local: Option<Vec<i32>>,
        /// Output file path (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
        #[command(flatten)]
        geometry: GeometryArgs,
    },
}

#[derive(Args)]
struct GeometryArgs {
    /// Store config JSON; its region geometry is used
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override block size exponent
    #[arg(long)]
    block_bits: Option<u32>,
    /// Override entry count
    #[arg(long)]
    entries: Option<u32>,
}

impl GeometryArgs {
    fn region_config(&self) -> Result<RegionFileConfig, StoreError> {
        let mut config = match &self.config {
            Some(path) => RegionStoreConfig::load_json(path)?.region,
            None => RegionFileConfig::default(),
        };
        if let Some(block_bits) = self.block_bits {
            config.block_bits = block_bits;
        }
        if let Some(entries) = self.entries {
            config.entries = entries;
        }
        config.validate()?;
        Ok(config)
    }
}

fn open_existing(input: &Path, geometry: &GeometryArgs) -> Result<RegionFile, StoreError> {
    if !input.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no region file at {}", input.display()),
        )
        .into());
    }
    RegionFile::open(input, geometry.region_config()?)
}

fn region_of(input: &Path) -> Option<RegionPos> {
    let name = input.file_name()?.to_str()?;
    let extension = input.extension()?.to_str()?;
    RegionPos::from_file_name(name, extension)
}

fn print_entries(input: &Path, geometry: &GeometryArgs) -> Result<(), StoreError> {
    let file = open_existing(input, geometry)?;
    let region = region_of(input);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for entry in file.entries() {
        let local = LocalIndex::from_index(entry.index)
            .map(|local| format!("{:?}", local.local_coords()))
            .unwrap_or_else(|| "-".to_string());
        let chunk = region
            .zip(LocalIndex::from_index(entry.index))
            .map(|(region, local)| {
                let chunk = region.chunk_at(local);
                format!("({}, {}, {})", chunk.x, chunk.y, chunk.z)
            })
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "{:>5}  local={local:<12} chunk={chunk:<20} blocks={}+{} bytes={}",
            entry.index, entry.run.start, entry.run.count, entry.byte_len
        )?;
    }
    Ok(())
}

fn print_stats(input: &Path, geometry: &GeometryArgs) -> Result<(), StoreError> {
    let file = open_existing(input, geometry)?;
    let stats = file.stats();
    let block_size = file.config().block_size();
    println!("file: {}", input.display());
    if let Some(region) = region_of(input) {
        println!("region: ({}, {}, {})", region.x, region.y, region.z);
    }
    println!(
        "geometry: {} entries, {} byte blocks",
        file.entry_count(),
        block_size
    );
    println!("present entries: {}", stats.present_entries);
    println!(
        "used blocks: {} ({} bytes)",
        stats.used_blocks,
        stats.used_blocks * block_size
    );
    println!(
        "free blocks: {} in {} runs",
        stats.free_blocks, stats.free_runs
    );
    println!("end block: {}", stats.end_block);
    Ok(())
}

fn dump_entry(
    input: &Path,
    index: Option<usize>,
    local: Option<Vec<i32>>,
    output: Option<&Path>,
    geometry: &GeometryArgs,
) -> Result<(), StoreError> {
    let index = match (index, local) {
        (Some(index), _) => index,
        (None, Some(local)) => match local.as_slice() {
            [x, y, z] => LocalIndex::from_local(*x, *y, *z).get(),
            _ => {
                return Err(invalid_input("--local expects 3 integers: X Y Z"));
            }
        },
        (None, None) => return Err(invalid_input("pass --index or --local")),
    };

    let file = open_existing(input, geometry)?;
    let Some(bytes) = file.read_entry(index)? else {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("entry {index} is not present"),
        )
        .into());
    };
    match output {
        Some(path) => {
            let mut writer = BufWriter::new(File::create(path)?);
            writer.write_all(&bytes)?;
            writer.flush()?;
            eprintln!("Wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => {
            let mut out = io::stdout().lock();
            out.write_all(&bytes)?;
            out.flush()?;
        }
    }
    Ok(())
}

fn invalid_input(message: &str) -> StoreError {
    io::Error::new(io::ErrorKind::InvalidInput, message.to_string()).into()
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Entries { input, geometry } => print_entries(input, geometry),
        Command::Stats { input, geometry } => print_stats(input, geometry),
        Command::Dump {
            input,
            index,
            local,
            output,
            geometry,
        } => dump_entry(input, *index, local.clone(), output.as_deref(), geometry),
    };

    if let Err(err) = result {
        exit_with_error(err);
    }
}

fn exit_with_error(err: StoreError) -> ! {
    eprintln!("Error: {}", err);
    std::process::exit(1);
}
