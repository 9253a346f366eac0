mod providers;

use anyhow::{bail, Context};
use cds_core::config::{
    cache_capacity_from_env_value, cancel_check_interval_from_env_value,
    guideline_version_from_env_value, resolve_config_dir,
};
use cds_core::provider::GuidelineConfigProvider;
use cds_core::{
    CancellationToken, CdsError, CompiledGuideline, CoreConfig, EvaluationResult,
    EvaluationService, MappingTable, OntologyNormalizer, RuleRepository, TenantOverlay,
};
use cds_types::{SourceCode, TenantId};
use cds_wire::{PatientPayload, PatientRecord};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use providers::DirectoryProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cds")]
#[command(about = "Clinical guideline rule evaluation engine")]
struct Cli {
    /// Configuration directory (overrides CDS_CONFIG_DIR)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one patient record
    Evaluate {
        /// Patient record (.json or .yaml)
        patient: PathBuf,
        /// Tenant whose overlay applies
        #[arg(long)]
        tenant: Option<String>,
        /// Evaluation date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Evaluate many patient records in parallel, one JSON line per record
    Batch {
        /// Patient records, or directories of them
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Stop every worker at the first failed record
        #[arg(long)]
        fail_fast: bool,
    },
    /// Compile the mapping table, every guideline version and every tenant overlay
    Check,
    /// Show the effective rule set for a tenant and date
    Resolve {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Map source codes (CURIEs such as LOINC:4548-4) to concepts
    Normalize {
        #[arg(required = true)]
        codes: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cds=info".parse()?)
                .add_directive("cds_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = Arc::new(load_config(cli.config_dir)?);
    let provider = DirectoryProvider::new(Arc::clone(&cfg));

    match cli.command {
        Some(Commands::Evaluate {
            patient,
            tenant,
            as_of,
        }) => {
            let tenant = parse_tenant(tenant)?;
            let service = build_service(&cfg, &provider, tenant.as_ref())?;
            let record = read_patient(&patient)?;
            let result = service.evaluate(&record, tenant.as_ref(), as_of.unwrap_or_else(today))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Some(Commands::Batch {
            inputs,
            tenant,
            as_of,
            threads,
            fail_fast,
        }) => {
            let tenant = parse_tenant(tenant)?;
            let service = build_service(&cfg, &provider, tenant.as_ref())?;
            let files = collect_patient_files(&inputs)?;
            run_batch(
                &service,
                &files,
                tenant.as_ref(),
                as_of.unwrap_or_else(today),
                threads,
                fail_fast,
            )?;
        }
        Some(Commands::Check) => check(&cfg, &provider)?,
        Some(Commands::Resolve { tenant, as_of }) => {
            let tenant = parse_tenant(tenant)?;
            let service = build_service(&cfg, &provider, tenant.as_ref())?;
            let resolved = service.repository().snapshot().effective_rule_set(
                tenant.as_ref(),
                as_of.unwrap_or_else(today),
                &cds_core::EffectiveRuleSetCache::new(1),
            )?;
            let rules = &resolved.rules;
            println!(
                "guideline {} overlay {} digest {}",
                rules.guideline_version(),
                rules.overlay_version().unwrap_or("-"),
                rules.digest()
            );
            for rule in rules.rules() {
                let thresholds: Vec<String> = rule
                    .thresholds
                    .iter()
                    .map(|(param, value)| format!("{param}={value}"))
                    .collect();
                println!(
                    "  [tier {}] {} ({}) {}",
                    rule.rule.tier,
                    rule.id(),
                    rule.rule.severity.as_str(),
                    thresholds.join(" ")
                );
            }
            for warning in &resolved.warnings {
                eprintln!("warning: {}", serde_json::to_string(warning)?);
            }
        }
        Some(Commands::Normalize { codes }) => {
            let table = MappingTable::compile(cds_core::MappingTableProvider::load(&provider)?)?;
            for raw in codes {
                let code = SourceCode::parse_curie(&raw)
                    .with_context(|| format!("'{raw}' is not a CURIE"))?;
                match table.lookup(&code) {
                    Some(concept) => {
                        let lineage: Vec<String> = table
                            .with_ancestors(concept)
                            .iter()
                            .map(ToString::to_string)
                            .collect();
                        println!("{code} -> {}", lineage.join(" < "));
                    }
                    None => println!("{code} -> unmapped"),
                }
            }
        }
        None => {
            println!("Use 'cds --help' for commands");
        }
    }

    Ok(())
}

fn load_config(override_dir: Option<PathBuf>) -> anyhow::Result<CoreConfig> {
    let override_dir = override_dir.or_else(|| std::env::var_os("CDS_CONFIG_DIR").map(PathBuf::from));
    let config_dir = resolve_config_dir(override_dir)?;
    let cfg = CoreConfig::new(
        config_dir,
        guideline_version_from_env_value(std::env::var("CDS_GUIDELINE_VERSION").ok())?,
        cancel_check_interval_from_env_value(std::env::var("CDS_CANCEL_CHECK_INTERVAL").ok())?,
        cache_capacity_from_env_value(std::env::var("CDS_RULE_SET_CACHE_CAPACITY").ok())?,
    )?;
    tracing::info!(
        config_dir = %cfg.config_dir().display(),
        guideline = %cfg.default_guideline_version(),
        "configuration resolved"
    );
    Ok(cfg)
}

/// Loads the mapping table, the default guideline version and, when given, the tenant's
/// configuration.
fn build_service(
    cfg: &Arc<CoreConfig>,
    provider: &DirectoryProvider,
    tenant: Option<&TenantId>,
) -> anyhow::Result<EvaluationService> {
    let table = MappingTable::compile(cds_core::MappingTableProvider::load(provider)?)?;

    let rules = Arc::new(RuleRepository::new(cfg.default_guideline_version().clone()));
    rules.publish_guideline(provider.load_guideline(cfg.default_guideline_version())?, &table)?;
    if let Some(tenant) = tenant {
        rules
            .refresh_tenant(provider, tenant, &table)
            .with_context(|| format!("loading configuration for tenant {tenant}"))?;
    }
    let ontology = Arc::new(OntologyNormalizer::new(table));

    Ok(EvaluationService::new(Arc::clone(cfg), ontology, rules))
}

fn check(cfg: &CoreConfig, provider: &DirectoryProvider) -> anyhow::Result<()> {
    let mut failures = 0usize;

    let table = match cds_core::MappingTableProvider::load(provider).and_then(MappingTable::compile) {
        Ok(table) => {
            println!(
                "ok    mappings {} ({} concepts, {} codes)",
                table.version(),
                table.concept_count(),
                table.code_count()
            );
            Some(table)
        }
        Err(err) => {
            failures += 1;
            println!("FAIL  mappings: {err}");
            None
        }
    };

    let mut guidelines = Vec::new();
    for version in provider.guideline_versions()? {
        let compiled = provider
            .load_guideline(&version)
            .and_then(CompiledGuideline::compile)
            .and_then(|compiled| match &table {
                Some(table) => compiled.check_concepts(table).map(|()| compiled),
                None => Ok(compiled),
            });
        match compiled {
            Ok(compiled) => {
                println!(
                    "ok    guideline {} ({} rules, digest {})",
                    compiled.version(),
                    compiled.len(),
                    compiled.digest()
                );
                guidelines.push(compiled);
            }
            Err(err) => {
                failures += 1;
                println!("FAIL  guideline {version}: {err}");
            }
        }
    }

    for tenant in provider.tenants()? {
        let result = GuidelineConfigProvider::load(provider, &tenant).and_then(|config| {
            let Some(doc) = config.overlay else {
                return Ok(None);
            };
            let overlay = TenantOverlay::from_document(doc);
            let guideline = guidelines
                .iter()
                .find(|g| g.version() == overlay.guideline_version())
                .ok_or_else(|| CdsError::UnknownGuidelineVersion(overlay.guideline_version().clone()))?;
            overlay.validate_against(guideline)?;
            Ok(Some(overlay))
        });
        match result {
            Ok(Some(overlay)) => println!(
                "ok    tenant {tenant} overlay {} on {}",
                overlay.version(),
                overlay.guideline_version()
            ),
            Ok(None) => println!("ok    tenant {tenant} (no overlay)"),
            Err(err) => {
                failures += 1;
                println!("FAIL  tenant {tenant}: {err}");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} configuration file(s) failed validation in {}", cfg.config_dir().display());
    }
    Ok(())
}

fn run_batch(
    service: &EvaluationService,
    files: &[PathBuf],
    tenant: Option<&TenantId>,
    as_of: NaiveDate,
    threads: usize,
    fail_fast: bool,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let threads = threads.clamp(1, files.len().max(1));
    let chunk = files.len().div_ceil(threads).max(1);

    let results: Vec<(PathBuf, anyhow::Result<EvaluationResult>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = files
            .chunks(chunk)
            .map(|batch| {
                let cancel = cancel.clone();
                scope.spawn(move || {
                    batch
                        .iter()
                        .map(|path| {
                            let result = read_patient(path).and_then(|record| {
                                service
                                    .evaluate_with_cancellation(&record, tenant, as_of, &cancel)
                                    .map_err(anyhow::Error::from)
                            });
                            if result.is_err() && fail_fast {
                                cancel.cancel();
                            }
                            (path.clone(), result)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    tracing::error!("batch worker panicked; its records are missing from the output");
                    Vec::new()
                })
            })
            .collect()
    });

    let mut failures = 0usize;
    for (path, result) in results {
        match result {
            Ok(result) => println!(
                "{}",
                serde_json::json!({ "file": path.display().to_string(), "result": result })
            ),
            Err(err) => {
                failures += 1;
                println!(
                    "{}",
                    serde_json::json!({ "file": path.display().to_string(), "error": format!("{err:#}") })
                );
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} record(s) failed", files.len());
    }
    Ok(())
}

fn collect_patient_files(inputs: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(input)
                .with_context(|| format!("listing {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| is_patient_file(path))
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn is_patient_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json" | "yaml" | "yml")
    )
}

fn read_patient(path: &Path) -> anyhow::Result<PatientRecord> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let record = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => PatientPayload::parse_yaml(&text),
        _ => PatientPayload::parse_json(&text),
    }
    .with_context(|| format!("parsing {}", path.display()))?;
    Ok(record)
}

fn parse_tenant(raw: Option<String>) -> anyhow::Result<Option<TenantId>> {
    raw.map(|t| TenantId::new(&t).with_context(|| format!("invalid tenant id '{t}'")))
        .transpose()
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}
