use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array1;
use occu::kernel::{CellIndex, KernelWorkspace};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;

struct Survey {
    cells: CellIndex,
    env_logit: Array1<f64>,
    obs_logit: Array1<f64>,
    not_detected: Array1<f64>,
}

fn survey(n_cells: usize, n_checklists: usize) -> Survey {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let normal = Normal::new(0.0, 1.5).unwrap();
    let cell_ids: Vec<usize> = (0..n_checklists).map(|_| rng.gen_range(0..n_cells)).collect();
    Survey {
        cells: CellIndex::new(&cell_ids, n_cells).unwrap(),
        env_logit: Array1::from_shape_fn(n_cells, |_| rng.sample(normal)),
        obs_logit: Array1::from_shape_fn(n_checklists, |_| rng.sample(normal)),
        not_detected: Array1::from_shape_fn(n_checklists, |_| f64::from(rng.gen_bool(0.8))),
    }
}

fn bench_kernel_value(c: &mut Criterion) {
    let s = survey(50_000, 200_000);
    let mut ws = KernelWorkspace::new(&s.cells);
    c.bench_function("kernel_value", |bencher| {
        bencher.iter(|| {
            let ll = ws.evaluate(
                s.env_logit.view(),
                s.obs_logit.view(),
                s.not_detected.view(),
                &s.cells,
                false,
            );
            black_box(ll);
        });
    });
}

fn bench_kernel_value_and_grad(c: &mut Criterion) {
    let s = survey(50_000, 200_000);
    let mut ws = KernelWorkspace::new(&s.cells);
    c.bench_function("kernel_value_and_grad", |bencher| {
        bencher.iter(|| {
            let ll = ws.evaluate(
                s.env_logit.view(),
                s.obs_logit.view(),
                s.not_detected.view(),
                &s.cells,
                true,
            );
            black_box((ll, ws.env_grad().sum()));
        });
    });
}

criterion_group!(benches, bench_kernel_value, bench_kernel_value_and_grad);
criterion_main!(benches);
