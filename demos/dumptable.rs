use unwind_plan::{BuilderConfig, Mapping, MappingProvider, PlanTableBuilder};

/// `print_table` never asks for mappings.
struct NoMappings;

impl MappingProvider for NoMappings {
    type Error = std::io::Error;

    fn mappings_for_pid(&self, _pid: u32) -> Result<Vec<Mapping>, Self::Error> {
        Ok(Vec::new())
    }
}

fn main() {
    env_logger::init();

    let mut args = std::env::args_os().skip(1);
    let Some(path) = args.next() else {
        eprintln!("Usage: dumptable <path>");
        std::process::exit(1);
    };

    let config = BuilderConfig::default().with_fde_cache_capacity(1);
    let builder = PlanTableBuilder::from_config(NoMappings, config);
    let stdout = std::io::stdout();
    if let Err(err) = builder.print_table(&mut stdout.lock(), path.as_ref()) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
