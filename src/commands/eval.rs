/// `geoflow eval` command implementation
use anyhow::{Context, Result};
use std::sync::Arc;

use geoflow::config::GeoflowConfig;
use geoflow::eval::{EvalOptions, Evaluated, Evaluator, ShellExecutor};

use super::open_cache;
use crate::cli::{CommonConfigArgs, EvalArgs};

pub fn run(args: &EvalArgs, config: &GeoflowConfig, common: &CommonConfigArgs) -> Result<()> {
    let registry = config.registry()?;
    let node = registry
        .parse(&args.expression)
        .with_context(|| format!("Invalid expression: {}", args.expression))?;

    let executor = Arc::new(ShellExecutor::new(args.verbose));
    let mut cache = open_cache(config, common, executor.clone())?;
    let locator = config.locator()?;
    let derived = config.derived_variables();

    let result = Evaluator::new(&mut cache, &registry, executor.as_ref(), &locator, &derived)
        .with_options(EvalOptions {
            use_cache: !args.no_cache,
        })
        .eval(&node);

    // Keep whatever was registered even when evaluation failed
    let saved = cache.close();
    let result = result.with_context(|| format!("Failed to evaluate {}", node.crs()))?;
    saved.context("Failed to save cache index")?;

    if args.json {
        let output = serde_json::json!({
            "crs": node.crs(),
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_result(&result, None);
    }

    Ok(())
}

fn print_result(result: &Evaluated, label: Option<&str>) {
    match result {
        Evaluated::Ensemble(members) => {
            for (member_label, member) in members {
                let label = match label {
                    Some(outer) => format!("{}/{}", outer, member_label),
                    None => member_label.clone(),
                };
                print_result(member, Some(&label));
            }
        }
        other => {
            for path in other.paths() {
                match label {
                    Some(label) => println!("{}\t{}", label, path.display()),
                    None => println!("{}", path.display()),
                }
            }
        }
    }
}
