use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use lirasm::config::CONFIG_FILE_NAME;
use lirasm::maps::NativePcOffsetToReferenceMap;
use lirasm::maps::mapping_table::MappingTable;
use lirasm::method::{CompiledArtifact, MethodDescription, MethodOutput, compile_method};
use lirasm::{AssemblerConfig, CodePatchSink, InstructionSet, PatchRecorder, compiled, logging};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum IsaArg {
    Thumb2,
    X86,
    Mips,
}

impl From<IsaArg> for InstructionSet {
    fn from(arg: IsaArg) -> Self {
        match arg {
            IsaArg::Thumb2 => InstructionSet::Thumb2,
            IsaArg::X86 => InstructionSet::X86,
            IsaArg::Mips => InstructionSet::Mips,
        }
    }
}

#[derive(Parser)]
#[command(name = "lirasm")]
#[command(about = "Assemble low-level IR methods into compiled method artifacts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble JSON method descriptions
    Assemble {
        /// Method description files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output directory for <name>.compiled.json files
        #[arg(short = 'o', long, default_value = ".")]
        out_dir: PathBuf,

        /// Worker threads (defaults to available parallelism)
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Config file (defaults to lirasm.toml in the current directory, if present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Target instruction set
        #[arg(long, value_enum)]
        isa: Option<IsaArg>,

        /// Keep nop'ed instructions in listings
        #[arg(long)]
        retain_nops: bool,

        /// Dump listings and tables
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the tables of a compiled artifact
    Inspect {
        /// A .compiled.json file
        file: PathBuf,
    },
    /// Write a default config file
    InitConfig {
        /// Destination (defaults to lirasm.toml)
        path: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Assemble { verbose: true, .. });
    if let Err(e) = logging::init(verbose) {
        eprintln!("warning: failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Assemble {
            files,
            out_dir,
            jobs,
            config,
            isa,
            retain_nops,
            verbose,
        } => {
            let mut config = match load_config(config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            if let Some(isa) = isa {
                config.instruction_set = isa.into();
            }
            config.retain_nops_for_diagnostics |= retain_nops;
            config.verbose |= verbose;

            if let Err(e) = std::fs::create_dir_all(&out_dir) {
                eprintln!("error: failed to create {}: {}", out_dir.display(), e);
                return ExitCode::FAILURE;
            }
            let jobs = jobs
                .or_else(|| thread::available_parallelism().ok().map(|n| n.get()))
                .unwrap_or(1)
                .max(1);
            if !assemble_all(&files, &out_dir, jobs, &config) {
                return ExitCode::FAILURE;
            }
        }
        Commands::Inspect { file } => {
            if let Err(e) = inspect(&file) {
                eprintln!("error: {}: {}", file.display(), e);
                return ExitCode::FAILURE;
            }
        }
        Commands::InitConfig { path } => {
            let path = path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            if path.exists() {
                eprintln!("error: {} already exists", path.display());
                return ExitCode::FAILURE;
            }
            if let Err(e) = AssemblerConfig::default().save(&path) {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
            println!("Created {}", path.display());
        }
    }

    ExitCode::SUCCESS
}

fn load_config(path: Option<&Path>) -> lirasm::Result<AssemblerConfig> {
    match path {
        Some(path) => AssemblerConfig::load(path),
        None => {
            let default = Path::new(CONFIG_FILE_NAME);
            if default.exists() {
                AssemblerConfig::load(default)
            } else {
                Ok(AssemblerConfig::default())
            }
        }
    }
}

struct Outcome {
    name: String,
    method_idx: u32,
    result: lirasm::Result<MethodOutput>,
}

fn compile_file(path: &Path, config: &AssemblerConfig, sink: &dyn CodePatchSink) -> Outcome {
    match MethodDescription::load(path) {
        Ok(desc) => Outcome {
            name: desc.name.clone(),
            method_idx: desc.method_idx,
            result: compile_method(&desc, config, sink),
        },
        Err(e) => Outcome {
            name: path.display().to_string(),
            method_idx: 0,
            result: Err(e),
        },
    }
}

/// Compile every file on `jobs` workers sharing one patch recorder.
/// Returns false if any method failed.
fn assemble_all(files: &[PathBuf], out_dir: &Path, jobs: usize, config: &AssemblerConfig) -> bool {
    let recorder = PatchRecorder::new();
    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<Outcome>>> = Mutex::new(files.iter().map(|_| None).collect());

    thread::scope(|s| {
        for _ in 0..jobs.min(files.len()) {
            s.spawn(|| {
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(path) = files.get(i) else {
                        break;
                    };
                    // A panic stays with its own method; the worker moves on.
                    let caught = panic::catch_unwind(AssertUnwindSafe(|| {
                        compile_file(path, config, &recorder)
                    }));
                    if let Ok(outcome) = caught {
                        slots.lock().unwrap_or_else(|e| e.into_inner())[i] = Some(outcome);
                    }
                }
            });
        }
    });
    let slots = slots.into_inner().unwrap_or_else(|e| e.into_inner());

    let mut ok = true;
    let mut count = 0;
    for (path, slot) in files.iter().zip(slots) {
        let Some(outcome) = slot else {
            eprintln!("error: {}: compilation panicked", path.display());
            ok = false;
            continue;
        };
        let output = match outcome.result {
            Ok(output) => output,
            Err(e) => {
                eprintln!("error: {}: {}", path.display(), e);
                ok = false;
                continue;
            }
        };
        let out = match CompiledArtifact::output_path(out_dir, &outcome.name) {
            Ok(out) => out,
            Err(e) => {
                eprintln!("error: {}: {}", path.display(), e);
                ok = false;
                continue;
            }
        };
        let artifact = CompiledArtifact {
            name: outcome.name,
            method_idx: outcome.method_idx,
            compiled: output.method,
            patches: output.patches,
            diagnostics: output.diagnostics,
        };
        if let Err(e) = artifact.save(&out) {
            eprintln!("error: {}: {}", out.display(), e);
            ok = false;
            continue;
        }
        for d in &artifact.diagnostics {
            println!("{}: {}", artifact.name, d);
        }
        println!(
            "{}: {} bytes, frame {}, {} patches -> {}",
            artifact.name,
            artifact.compiled.code.len(),
            artifact.compiled.frame_size_in_bytes,
            artifact.patches.len(),
            out.display()
        );
        count += 1;
    }
    println!("{} methods compiled, {} patches recorded", count, recorder.len());
    ok
}

fn inspect(path: &Path) -> lirasm::Result<()> {
    let artifact = CompiledArtifact::load(path)?;
    let method = &artifact.compiled;
    println!("method {} (#{})", artifact.name, artifact.method_idx);
    println!("  isa: {}", method.instruction_set);
    println!("  code: {} bytes", method.code.len());
    println!("  frame: {} bytes", method.frame_size_in_bytes);
    println!(
        "  spills: core 0x{:08x}, fp 0x{:08x}",
        method.core_spill_mask, method.fp_spill_mask
    );

    let table = MappingTable::decode(&method.mapping_table)?;
    println!("  pc2dex ({}):", table.pc_to_dex().len());
    for e in table.pc_to_dex() {
        println!("    0x{:05x} -> 0x{:04x}", e.native_pc_offset, e.dex_pc);
    }
    println!("  dex2pc ({}):", table.dex_to_pc().len());
    for e in table.dex_to_pc() {
        println!("    0x{:04x} -> 0x{:05x}", e.dex_pc, e.native_pc_offset);
    }

    if !method.gc_map.is_empty() {
        let map = NativePcOffsetToReferenceMap::new(&method.gc_map)?;
        println!(
            "  gc map: {} entries, offset width {}, bitmap width {}",
            map.num_entries(),
            map.native_offset_width(),
            map.reg_width()
        );
        for i in 0..map.num_entries() {
            println!("    0x{:05x}: {:02x?}", map.code_offset(i), map.entry_bitmap(i));
        }
    }

    let vmap = compiled::decode_vmap_table(&method.vmap_table)?;
    println!("  vmap: {:?}", vmap);

    for patch in &artifact.patches {
        println!(
            "  patch {:?} @0x{:x}: target #{} ({:?})",
            patch.kind, patch.literal_offset, patch.target_method_idx, patch.target_invoke_type
        );
    }
    for d in &artifact.diagnostics {
        println!("  {}", d);
    }
    Ok(())
}
