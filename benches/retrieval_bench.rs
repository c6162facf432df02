use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use towerrec::config::{LossKind, ModelConfig, TrainingConfig};
use towerrec::*;

fn build_model(num_users: usize, num_items: usize) -> TwoTowerModel {
    let mut rng = StdRng::seed_from_u64(42);
    TwoTowerModel::new(&ModelConfig::default(), num_users, num_items, &mut rng).unwrap()
}

fn benchmark_training(c: &mut Criterion) {
    let pairs: Vec<TrainingPair> = (0..256).map(|i| TrainingPair::new(i % 500, (i * 7) % 2000)).collect();

    for (name, loss) in [
        ("train_step_in_batch_softmax", LossKind::InBatchSoftmax),
        ("train_step_pairwise", LossKind::Pairwise),
    ] {
        let mut model = build_model(500, 2000);
        let config = TrainingConfig {
            loss,
            seed: Some(1),
            ..TrainingConfig::default()
        };
        let mut trainer = Trainer::for_model(config, &model, &pairs).unwrap();

        c.bench_function(name, |b| {
            b.iter(|| black_box(trainer.train_step(&mut model, &pairs).unwrap()));
        });
    }
}

fn benchmark_retrieval(c: &mut Criterion) {
    let model = build_model(10, 20_000);

    for chunk_size in [256, 4096] {
        let retriever = Retriever::new(chunk_size);
        c.bench_function(&format!("top_k_chunk_{chunk_size}"), |b| {
            b.iter(|| black_box(retriever.top_k(&model, 3, 10)));
        });
    }

    let retriever = Retriever::default();
    c.bench_function("base_scores", |b| {
        b.iter(|| black_box(retriever.base_scores(&model, 3).unwrap()));
    });
}

fn benchmark_utils(c: &mut Criterion) {
    use towerrec::utils::*;

    let scores: Vec<f32> = (0..20_000).map(|i| ((i * 7919) % 1000) as f32 / 1000.0).collect();
    c.bench_function("top_k_indices", |b| {
        b.iter(|| black_box(top_k_indices(&scores, 10)));
    });

    let interactions: Vec<Interaction> = (0..10_000)
        .map(|i| Interaction::new(i % 1000, (i * 31) % 5000).with_timestamp(i as i64))
        .collect();
    c.bench_function("leave_one_out_split", |b| {
        b.iter(|| black_box(leave_one_out_split(&interactions)));
    });
}

criterion_group!(benches, benchmark_training, benchmark_retrieval, benchmark_utils);
criterion_main!(benches);
