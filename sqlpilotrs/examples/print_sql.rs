use std::{env, fs, path::PathBuf};

use sqlpilot::{
    dialect::DialectRegistry, query_builder::QueryCompiler, registry::DatasetRegistry, QuerySpec,
};

fn usage() {
    eprintln!("Usage: print_sql <root_dir> <dataset> <query_json> [engine]");
    eprintln!("Example: cargo run --example print_sql -- ./project orders ./by_region.json postgresql");
}

fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 3 {
        usage();
        std::process::exit(1);
    }

    let root = PathBuf::from(args.remove(0));
    let dataset_name = args.remove(0);
    let request_path = PathBuf::from(args.remove(0));
    let engine = args.pop().unwrap_or_else(|| "duckdb".to_string());

    let registry = DatasetRegistry::load_from_dir(root)?;
    let dataset = registry.require(&dataset_name)?;
    let spec: QuerySpec = serde_json::from_str(&fs::read_to_string(request_path)?)?;

    let compiler = QueryCompiler::new(DialectRegistry::default().get(&engine));
    let compiled = compiler.compile_select(&spec, dataset, None)?;
    println!("{}", compiled.display_sql());
    Ok(())
}
