use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use towerrec::algorithms::initializer::rng_from_seed;
use towerrec::utils::metrics::{evaluate, RecommendationMetrics};
use towerrec::utils::validation::validate_interaction;
use towerrec::utils::{leave_one_out_split, seen_items};
use towerrec::{init_tracing, Config, Interaction, Recommendation, Retriever, Trainer, TrainingReport, TwoTowerModel};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Whitespace-separated `user item [rating [timestamp]]` records
    #[arg(short, long)]
    interactions: String,

    /// Print recommendations for this user only
    #[arg(short, long)]
    user: Option<usize>,

    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct UserRecommendations {
    user: usize,
    items: Vec<Recommendation>,
}

#[derive(Serialize)]
struct Output {
    training: TrainingReport,
    evaluation: RecommendationMetrics,
    recommendations: Vec<UserRecommendations>,
}

fn parse_interactions(text: &str) -> Result<Vec<Interaction>> {
    let mut interactions = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 || fields.len() > 4 {
            bail!("line {}: expected `user item [rating [timestamp]]`", line_no + 1);
        }
        let user = fields[0]
            .parse()
            .with_context(|| format!("line {}: bad user index", line_no + 1))?;
        let item = fields[1]
            .parse()
            .with_context(|| format!("line {}: bad item index", line_no + 1))?;

        let mut interaction = Interaction::new(user, item);
        if let Some(rating) = fields.get(2) {
            let rating = rating
                .parse()
                .with_context(|| format!("line {}: bad rating", line_no + 1))?;
            interaction = interaction.with_rating(rating);
        }
        if let Some(timestamp) = fields.get(3) {
            let timestamp = timestamp
                .parse()
                .with_context(|| format!("line {}: bad timestamp", line_no + 1))?;
            interaction = interaction.with_timestamp(timestamp);
        }
        interactions.push(interaction);
    }
    Ok(interactions)
}

fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing();

    let config = if Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };

    let text = std::fs::read_to_string(&args.interactions)
        .with_context(|| format!("reading {}", args.interactions))?;
    let interactions = parse_interactions(&text)?;
    if interactions.is_empty() {
        bail!("{} contains no interactions", args.interactions);
    }

    let num_users = interactions.iter().map(|i| i.user).max().map_or(0, |m| m + 1);
    let num_items = interactions.iter().map(|i| i.item).max().map_or(0, |m| m + 1);
    for interaction in &interactions {
        validate_interaction(interaction, num_users, num_items)?;
    }
    info!(
        "Loaded {} interactions over {} users and {} items",
        interactions.len(),
        num_users,
        num_items
    );

    let (train, test) = leave_one_out_split(&interactions);
    if train.is_empty() {
        bail!("no training pairs left after the evaluation split");
    }

    let mut rng = rng_from_seed(config.training.seed);
    let mut model = TwoTowerModel::new(&config.model, num_users, num_items, &mut rng)?;
    let mut trainer = Trainer::for_model(config.training.clone(), &model, &train)?;
    let report = trainer.fit(&mut model, &train)?;
    if report.skipped_batches > 0 {
        warn!("{} batches were skipped during training", report.skipped_batches);
    }

    let k = args.top_k.unwrap_or(config.retrieval.top_k);
    let retriever = Retriever::from_config(&config.retrieval);
    let evaluation = evaluate(&model, &retriever, &train, &test, k)?;

    let seen = seen_items(&train, num_users);
    let users: Vec<usize> = match args.user {
        Some(user) => vec![user],
        None => (0..num_users).collect(),
    };
    let mut recommendations = Vec::with_capacity(users.len());
    for user in users {
        let exclude: &[usize] = match (config.retrieval.exclude_seen, seen.get(user)) {
            (true, Some(items)) => items.as_slice(),
            _ => &[],
        };
        let items = retriever.recommend_excluding(&model, user, k, exclude)?;
        recommendations.push(UserRecommendations { user, items });
    }

    let output = Output {
        training: report,
        evaluation,
        recommendations,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
