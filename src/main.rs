use std::{process, sync::Arc};

use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;
use vitrine::{
    application::{catalog::load_catalog, error::AppError, promotions::PromotionFeed},
    cache::{CacheConfig, CacheTier, Entity, Operation, QueryClient, StrategyResolver},
    config::{self, Command, RotateArgs, Settings, StrategyArgs},
    domain::{marketplace, promotions::Promotion},
    infra::{memory_store::MemoryStore, telemetry},
    rotation::{
        CandidateSource, RandomSource, RngSource, RotationPolicy, Rotator, Sponsored,
        compute_weights,
    },
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, causes = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, causes = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match cli_args.command.unwrap_or(Command::Tiers) {
        Command::Tiers => run_tiers(),
        Command::Strategy(args) => run_strategy(&settings, args),
        Command::Rotate(args) => run_rotate(settings, args).await,
    }
}

fn build_resolver(settings: &Settings) -> Result<StrategyResolver, AppError> {
    let builder = settings.cache.apply_overrides(marketplace::strategy_builder());
    Ok(builder.build()?)
}

fn run_tiers() -> Result<(), AppError> {
    println!(
        "{:<8} {:>10} {:>10} {:>6} {:>6} {:>10} {:>6}",
        "tier", "stale", "gc", "mount", "focus", "reconnect", "retry"
    );
    for tier in CacheTier::ALL {
        let strategy = tier.strategy();
        println!(
            "{:<8} {:>10} {:>10} {:>6} {:>6} {:>10} {:>6}",
            tier.as_str(),
            format!("{}s", strategy.stale_time.as_secs()),
            format!("{}s", strategy.gc_time.as_secs()),
            strategy.refetch_on_mount,
            strategy.refetch_on_focus,
            strategy.refetch_on_reconnect,
            strategy.retry_count,
        );
    }
    Ok(())
}

fn run_strategy(settings: &Settings, args: StrategyArgs) -> Result<(), AppError> {
    let resolver = build_resolver(settings)?;
    let entity = Entity::new(args.entity.trim());
    let Ok(operation) = args.operation.trim().parse::<Operation>();
    let (strategy, source) =
        resolver.resolve_with_source(&entity, &operation, args.context.as_deref());

    println!(
        "{entity}/{operation}{} -> stale {}s, gc {}s, retry {} ({source})",
        args.context
            .as_deref()
            .map(|context| format!("@{context}"))
            .unwrap_or_default(),
        strategy.stale_time.as_secs(),
        strategy.gc_time.as_secs(),
        strategy.retry_count,
    );
    Ok(())
}

async fn run_rotate(settings: Settings, args: RotateArgs) -> Result<(), AppError> {
    let catalog = load_catalog(&args.catalog)?;
    let store = Arc::new(MemoryStore::new());
    let seeded = catalog.seed(&store)?;
    info!(promotions = seeded, catalog = %args.catalog.display(), "catalog loaded");

    let client = QueryClient::new(
        &CacheConfig::from(&settings.cache),
        build_resolver(&settings)?,
        marketplace::entity_registry()?,
        store,
    );
    let feed = Arc::new(PromotionFeed::new(client));

    let weighted = compute_weights(feed.candidates().await?);
    if weighted.is_empty() {
        return Err(AppError::validation(
            "catalog has no active promotion with a positive budget",
        ));
    }
    for entry in &weighted {
        println!(
            "{:<12} budget {:>10.2} weight {:>7.3} p {:.3}",
            entry.item.id(),
            entry.item.budget(),
            entry.weight,
            entry.probability,
        );
    }

    let rng: Box<dyn RandomSource> = match args.seed {
        Some(seed) => Box::new(RngSource::seeded(seed)),
        None => Box::new(RngSource::from_os_rng()),
    };
    let policy = RotationPolicy {
        interval: settings.rotation.interval,
        exclude_previous: settings.rotation.exclude_previous,
    };
    let source: Arc<dyn CandidateSource<Promotion>> = feed;
    let handle = Rotator::spawn(
        policy,
        source,
        rng,
        Arc::new(|promotion: &Promotion| info!(id = %promotion.id, "promotion shown")),
    );
    let mut selections = handle.subscribe();

    for round in 1..=args.rounds {
        selections
            .changed()
            .await
            .map_err(|_| AppError::unexpected("rotation stopped"))?;
        if let Some(promotion) = selections.borrow_and_update().as_ref() {
            println!("#{round:<3} {} ({})", promotion.title, promotion.id());
        }
    }
    handle.stop();
    Ok(())
}
