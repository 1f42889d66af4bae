use clap::{Parser, Subcommand};
use genericio::{
    CodecId, Communicator, GioConfig, GioReader, GioWriter, MismatchPolicy, SelfComm, ThreadComm,
    Variable, VariableInfo,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gio", about = "Inspect and rewrite GenericIO files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the header: dimensions, variables and per-rank records
    Info {
        input: String,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the rows of every variable
    Print {
        input: String,
        /// Only this file rank
        #[arg(short, long)]
        rank: Option<usize>,
        /// Rows printed per rank (0 prints all)
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Read every variable of every rank and report CRC status
    Verify {
        input: String,
    },
    /// Read under redistribution with N in-process ranks and write a new file
    Rewrite {
        input:  String,
        output: String,
        /// Number of writing ranks
        #[arg(short = 'N', long, default_value = "1")]
        ranks: usize,
        /// Compress the output blocks
        #[arg(short, long)]
        compress: bool,
        /// Codec: zstd (default), lz4, brotli, lzma, none
        #[arg(long, default_value = "zstd")]
        codec: String,
        /// Compression level (zstd 1-19; brotli 0-11; ignored for lz4/lzma)
        #[arg(short, long, default_value = "3")]
        level: i32,
    },
}

#[derive(Serialize)]
struct FileSummary {
    path:        String,
    endian:      &'static str,
    num_ranks:   u64,
    total_elems: u64,
    dims:        [u64; 3],
    phys_origin: [f64; 3],
    phys_scale:  [f64; 3],
    variables:   Vec<VariableInfo>,
    ranks:       Vec<RankSummary>,
}

#[derive(Serialize)]
struct RankSummary {
    rank:        usize,
    coords:      [u64; 3],
    nelems:      u64,
    global_rank: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let config = GioConfig::from_env();

    match Cli::parse().command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let reader = open_solo(&input, &config)?;
            let summary = summarize(&reader)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }

            println!("── GenericIO file ───────────────────────────────────────");
            println!("  Path           {}", summary.path);
            println!("  Byte order     {}", summary.endian);
            println!("  Ranks          {}", summary.num_ranks);
            println!("  Elements       {}", summary.total_elems);
            println!("  Dims           {:?}", summary.dims);
            println!("  Phys origin    {:?}", summary.phys_origin);
            println!("  Phys scale     {:?}", summary.phys_scale);
            println!("  Variables ({}):", summary.variables.len());
            for v in &summary.variables {
                println!("    {:<24} {:<4} {}", v.name, v.type_name(), flag_labels(v));
            }
            println!("{:>6} {:>12} {:>8}  Coords", "Rank", "Elements", "Global");
            for r in &summary.ranks {
                println!("{:>6} {:>12} {:>8}  {:?}", r.rank, r.nelems, r.global_rank, r.coords);
            }
        }

        // ── Print ────────────────────────────────────────────────────────────
        Commands::Print { input, rank, limit } => {
            let reader = open_solo(&input, &config)?;
            let infos = reader.variable_info()?;
            let ranks: Vec<usize> = match rank {
                Some(r) => vec![r],
                None => (0..reader.read_num_ranks()? as usize).collect(),
            };

            for r in ranks {
                let (rows, columns) = read_rank(&reader, &infos, r)?;
                println!("# rank {r}: {rows} row(s)");
                println!("{}", infos.iter().map(|v| v.name.as_str()).collect::<Vec<_>>().join("\t"));
                let shown = if limit == 0 { rows } else { rows.min(limit) };
                for row in 0..shown {
                    let cells: Vec<String> = infos
                        .iter()
                        .zip(&columns)
                        .map(|(info, col)| format_element(info, &col[row * info.size..(row + 1) * info.size]))
                        .collect();
                    println!("{}", cells.join("\t"));
                }
                if shown < rows {
                    println!("... {} more", rows - shown);
                }
            }
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input } => {
            let reader = open_solo(&input, &config)?;
            let infos = reader.variable_info()?;
            let nranks = reader.read_num_ranks()? as usize;
            let mut bad = 0usize;
            for r in 0..nranks {
                match read_rank(&reader, &infos, r) {
                    Ok((rows, _)) => println!("  ok      rank {r:>6}  {rows} row(s)"),
                    Err(e) => {
                        bad += 1;
                        println!("  FAILED  rank {r:>6}  {e}");
                    }
                }
            }
            println!("{} of {nranks} rank(s) intact", nranks - bad);
            if bad > 0 {
                std::process::exit(1);
            }
        }

        // ── Rewrite ──────────────────────────────────────────────────────────
        Commands::Rewrite { input, output, ranks, compress, codec, level } => {
            let config = config
                .with_compress(compress)
                .with_codec(parse_codec(&codec))
                .with_compression_level(level);
            let results = ThreadComm::run(ranks.max(1), |comm| rewrite_rank(comm, &input, &output, &config));
            let mut written = 0u64;
            for result in results {
                written += result?;
            }
            println!("Rewrote {input} → {output} on {} rank(s), {written} byte(s)", ranks.max(1));
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_solo(path: &str, config: &GioConfig) -> genericio::Result<GioReader> {
    let comm: Arc<dyn Communicator> = Arc::new(SelfComm::default());
    let mut reader = GioReader::new(comm, path, config.clone());
    reader.open_and_read_header(MismatchPolicy::Allowed, None, false)?;
    Ok(reader)
}

fn summarize(reader: &GioReader) -> genericio::Result<FileSummary> {
    let header = reader.header().ok_or(genericio::GioError::NotOpen)?;
    let num_ranks = reader.read_num_ranks()?;
    let ranks = (0..num_ranks as usize)
        .map(|r| {
            Ok(RankSummary {
                rank:        r,
                coords:      reader.read_coords(r)?,
                nelems:      reader.read_num_elems(Some(r))?,
                global_rank: reader.read_global_rank_number(r)?,
            })
        })
        .collect::<genericio::Result<Vec<_>>>()?;
    Ok(FileSummary {
        path:        reader.file_name().to_owned(),
        endian:      header.endian().name(),
        num_ranks,
        total_elems: reader.read_total_num_elems()?,
        dims:        reader.read_dims()?,
        phys_origin: reader.read_phys_origin()?,
        phys_scale:  reader.read_phys_scale()?,
        variables:   reader.variable_info()?,
        ranks,
    })
}

/// Every variable of file rank `rank`, one byte column per variable.
fn read_rank(reader: &GioReader, infos: &[VariableInfo], rank: usize) -> genericio::Result<(usize, Vec<Vec<u8>>)> {
    let rows = reader.read_num_elems(Some(rank))? as usize;
    let mut columns: Vec<Vec<u8>> = infos.iter().map(|v| vec![0u8; rows * v.size]).collect();
    let mut vars: Vec<Variable<'_>> = infos
        .iter()
        .zip(columns.iter_mut())
        .map(|(info, col)| Variable::from_bytes(info.clone(), col))
        .collect();
    reader.read_data(&mut vars, Some(rank))?;
    drop(vars);
    Ok((rows, columns))
}

fn rewrite_rank(comm: Arc<dyn Communicator>, input: &str, output: &str, config: &GioConfig) -> genericio::Result<u64> {
    let mut reader = GioReader::new(comm.clone(), input, config.clone());
    reader.open_and_read_header(MismatchPolicy::Redistribute, None, true)?;
    let infos = reader.variable_info()?;
    let rows = reader.read_num_elems(None)? as usize;

    let mut columns: Vec<Vec<u8>> = infos.iter().map(|v| vec![0u8; rows * v.size]).collect();
    let mut vars: Vec<Variable<'_>> = infos
        .iter()
        .zip(columns.iter_mut())
        .map(|(info, col)| Variable::from_bytes(info.clone(), col))
        .collect();
    reader.read_data(&mut vars, None)?;

    let mut writer = GioWriter::new(comm, output, config.clone());
    writer.set_num_elems(rows as u64);
    writer.set_phys_origin(reader.read_phys_origin()?);
    writer.set_phys_scale(reader.read_phys_scale()?);
    let stats = writer.write(&mut vars)?;
    Ok(stats.bytes_written)
}

fn format_element(info: &VariableInfo, bytes: &[u8]) -> String {
    use bytemuck::pod_read_unaligned as get;
    match (info.is_float, info.is_signed, info.size) {
        (true, _, 4)      => get::<f32>(bytes).to_string(),
        (true, _, 8)      => get::<f64>(bytes).to_string(),
        (false, true, 1)  => get::<i8>(bytes).to_string(),
        (false, true, 2)  => get::<i16>(bytes).to_string(),
        (false, true, 4)  => get::<i32>(bytes).to_string(),
        (false, true, 8)  => get::<i64>(bytes).to_string(),
        (false, false, 1) => get::<u8>(bytes).to_string(),
        (false, false, 2) => get::<u16>(bytes).to_string(),
        (false, false, 4) => get::<u32>(bytes).to_string(),
        (false, false, 8) => get::<u64>(bytes).to_string(),
        _ => hex::encode(bytes),
    }
}

fn flag_labels(v: &VariableInfo) -> String {
    let mut labels = Vec::new();
    if v.phys_coord_x { labels.push("x"); }
    if v.phys_coord_y { labels.push("y"); }
    if v.phys_coord_z { labels.push("z"); }
    if v.maybe_ghost  { labels.push("ghost"); }
    labels.join(",")
}

fn parse_codec(s: &str) -> CodecId {
    CodecId::from_name(s).unwrap_or_else(|| {
        eprintln!("Unknown codec '{}', defaulting to zstd", s);
        CodecId::Zstd
    })
}
