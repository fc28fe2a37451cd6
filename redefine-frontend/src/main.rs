use std::{
    error::Error,
    path::{Path, PathBuf},
};

use clap::{ArgEnum, Args, Parser, Subcommand};
use redefine::{
    merge_constant_pools, ClassReport, MethodChangePolicy, RedefineConfig, RedefinitionReport,
    Runtime,
};
use redefine_base::{class_file::ClassFileReader, ClassId, ConstantPool, SymbolTable};
use tracing_subscriber::layer::SubscriberExt;

mod formatter;

#[derive(Debug, Parser)]
#[clap(name = "Redefine (Frontend)")]
#[clap(version = "0.1.0")]
#[clap(about = "Inspect and exercise class redefinition on class files")]
#[clap(propagate_version = true)]
struct CliArgs {
    #[clap(subcommand)]
    command: CliCommands,
}

#[derive(Debug, Subcommand)]
enum CliCommands {
    /// Print the constant pool of a class file
    Dump {
        #[clap(parse(from_os_str), value_name = "CLASS_FILE")]
        class: PathBuf,
    },
    /// Merge the pool of NEW into the pool of OLD, printing the result and what moved
    Merge {
        #[clap(parse(from_os_str), value_name = "OLD")]
        old: PathBuf,
        #[clap(parse(from_os_str), value_name = "NEW")]
        new: PathBuf,
    },
    /// Define OLD and then redefine it with each NEW in turn
    Redefine {
        #[clap(parse(from_os_str), value_name = "OLD")]
        old: PathBuf,
        #[clap(parse(from_os_str), value_name = "NEW", required = true)]
        new: Vec<PathBuf>,
        #[clap(flatten)]
        options: RedefineOptions,
    },
    /// Define OLD, redefine it with NEW, and write the installed class back out
    Reconstitute {
        #[clap(parse(from_os_str), value_name = "OLD")]
        old: PathBuf,
        #[clap(parse(from_os_str), value_name = "NEW")]
        new: PathBuf,
        #[clap(short, long, parse(from_os_str), value_name = "OUT")]
        output: PathBuf,
        #[clap(flatten)]
        options: RedefineOptions,
    },
}

#[derive(Debug, Args)]
struct RedefineOptions {
    /// Which methods may be added or deleted
    #[clap(long, arg_enum, default_value = "private-static-or-final")]
    policy: PolicyArg,
    /// Verify each merged candidate again, and check its rewrite can be undone
    #[clap(long)]
    verify_merged: bool,
    /// Sweep every class for stale method references after installing
    #[clap(long)]
    check_fixups: bool,
}
impl RedefineOptions {
    fn config(&self) -> RedefineConfig {
        let mut conf = RedefineConfig::new();
        conf.method_change_policy = match self.policy {
            PolicyArg::Disallow => MethodChangePolicy::Disallow,
            PolicyArg::PrivateStaticOrFinal => MethodChangePolicy::PrivateStaticOrFinal,
            PolicyArg::Private => MethodChangePolicy::Private,
        };
        conf.verify_merged |= self.verify_merged;
        conf.check_fixups |= self.check_fixups;
        conf
    }
}

#[derive(Debug, Clone, Copy, ArgEnum)]
enum PolicyArg {
    Disallow,
    PrivateStaticOrFinal,
    Private,
}

struct EmptyWriter;
impl std::io::Write for EmptyWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn make_log_file() -> std::sync::Arc<std::fs::File> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("./redefine.log")
        .expect("Expected to be able to open log file");
    std::sync::Arc::new(log_file)
}

fn init_logging(level: tracing::Level) {
    let should_log_console = std::env::var("REDEFINE_LOG_CONSOLE")
        .map(|x| x != "0")
        .unwrap_or(true);
    let should_log_file = std::env::var("REDEFINE_LOG_FILE")
        .map(|x| x != "0")
        .unwrap_or(true);

    let console_layer = if should_log_console {
        Some(
            tracing_subscriber::fmt::Layer::default()
                .with_writer(std::io::stderr)
                .without_time()
                .event_format(formatter::Formatter),
        )
    } else {
        None
    };
    let file_layer = if should_log_file {
        Some(
            tracing_subscriber::fmt::Layer::default()
                .with_writer(make_log_file())
                .without_time()
                .event_format(formatter::Formatter),
        )
    } else {
        None
    };

    let t_subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .event_format(formatter::Formatter)
        .with_writer(|| EmptyWriter)
        .finish()
        .with(console_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(t_subscriber)
        .expect("failed to set global default tracing subscriber");
}

fn main() {
    // Note that clap autoexits if it didn't get a thing to do
    let args = CliArgs::parse();
    init_logging(RedefineConfig::compute_tracing_level());

    let result = match &args.command {
        CliCommands::Dump { class } => dump(class),
        CliCommands::Merge { old, new } => merge(old, new),
        CliCommands::Redefine { old, new, options } => redefine(old, new, options),
        CliCommands::Reconstitute {
            old,
            new,
            output,
            options,
        } => reconstitute(old, new, output, options),
    };

    if let Err(err) = result {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn print_pool(pool: &ConstantPool) {
    for (index, entry) in pool.iter() {
        println!("  #{:<5} {:?}", index, entry);
    }
    for (index, specifier) in pool.operands().iter().enumerate() {
        println!("  bootstrap {:<3} {:?}", index, specifier);
    }
}

fn dump(class: &Path) -> Result<(), Box<dyn Error>> {
    let symbols = SymbolTable::new();
    let (data, pool) = ClassFileReader::new(&symbols).parse(&std::fs::read(class)?)?;
    println!(
        "{} (version {}.{}, {} entries)",
        data.name(&pool)?,
        data.version.major,
        data.version.minor,
        pool.count()
    );
    print_pool(&pool);
    Ok(())
}

fn merge(old: &Path, new: &Path) -> Result<(), Box<dyn Error>> {
    let symbols = SymbolTable::new();
    let reader = ClassFileReader::new(&symbols);
    let (_, old_pool) = reader.parse(&std::fs::read(old)?)?;
    let (_, new_pool) = reader.parse(&std::fs::read(new)?)?;

    let merged = merge_constant_pools(&old_pool, &new_pool)?;
    println!(
        "merged pool: {} entries, {} appended",
        merged.pool.count(),
        merged.appended
    );
    print_pool(&merged.pool);

    println!("moved:");
    for (from, to) in merged.map.sorted_indices() {
        println!("  #{} -> #{}", from, to);
    }
    for (from, to) in merged.map.sorted_operands() {
        println!("  bootstrap {} -> {}", from, to);
    }
    Ok(())
}

fn print_class_report(report: &ClassReport) {
    println!(
        "{}: version {} (redefinition {}, id {})",
        report.name, report.version, report.redefinition_count, report.redefinition_id
    );
    println!(
        "  methods: {} equivalent, {} obsolete, {} added, {} deleted",
        report.emcp_methods, report.obsolete_methods, report.added_methods, report.deleted_methods
    );
    println!(
        "  pool: {} appended, {} moved, {} ldc widened",
        report.appended_entries, report.moved_entries, report.widened_loads
    );
    println!("  kept previous version: {}", report.kept_previous_version);
}

fn print_report(report: &RedefinitionReport) {
    println!(
        "epoch {}, {} table slot(s) and cache entries retargeted",
        report.epoch, report.retargeted
    );
    for class in &report.classes {
        print_class_report(class);
    }
}

fn define(runtime: &Runtime, old: &Path) -> Result<ClassId, Box<dyn Error>> {
    let id = runtime.define_class(&std::fs::read(old)?)?;
    tracing::info!("Defined {} as {:?}", old.display(), id);
    Ok(id)
}

fn redefine(
    old: &Path,
    new: &[PathBuf],
    options: &RedefineOptions,
) -> Result<(), Box<dyn Error>> {
    let runtime = Runtime::new(options.config());
    let id = define(&runtime, old)?;
    for candidate in new {
        let report = runtime.redefine_class(id, &std::fs::read(candidate)?)?;
        print_report(&report);
    }
    Ok(())
}

fn reconstitute(
    old: &Path,
    new: &Path,
    output: &Path,
    options: &RedefineOptions,
) -> Result<(), Box<dyn Error>> {
    let runtime = Runtime::new(options.config());
    let id = define(&runtime, old)?;
    let report = runtime.redefine_class(id, &std::fs::read(new)?)?;
    print_report(&report);

    let bytes = runtime.reconstitute_class_file(id)?;
    std::fs::write(output, &bytes)?;
    println!("wrote {} bytes to {}", bytes.len(), output.display());
    Ok(())
}
