use backup_warden::backup::compression::compress_bytes;
use backup_warden::backup::{ArtifactName, BackupArtifact, DatabaseKind};
use backup_warden::retention::{apply, RetentionPolicy};
use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::path::PathBuf;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 3, 30, 0).unwrap()
}

// One artifact every `step_hours`, going back from now
fn history(count: usize, step_hours: i64) -> Vec<BackupArtifact> {
    (0..count)
        .map(|i| {
            let name = ArtifactName::new(DatabaseKind::Postgres, now() - Duration::hours(step_hours * i as i64));
            BackupArtifact::local(&name, PathBuf::from("/backups").join(name.file_name()), 4096)
        })
        .collect()
}

fn benchmark_retention(c: &mut Criterion) {
    let mut group = c.benchmark_group("retention_apply");
    let policy = RetentionPolicy::default();

    // A year of daily backups, then hourly backups for the same year
    for (label, count, step) in [("daily_1y", 365usize, 24i64), ("hourly_1y", 8760, 1)] {
        let artifacts = history(count, step);
        group.bench_with_input(BenchmarkId::from_parameter(label), &artifacts, |b, artifacts| {
            b.iter(|| black_box(apply(&policy, now(), artifacts)))
        });
    }
    group.finish();
}

fn benchmark_compression(c: &mut Criterion) {
    let dump: Vec<u8> = (0..20_000)
        .flat_map(|i| format!("INSERT INTO bookings VALUES ({}, 'guest-{}', '2025-01-01');\n", i, i % 97).into_bytes())
        .collect();

    c.bench_function("gzip_sql_dump", |b| b.iter(|| black_box(compress_bytes(&dump).unwrap())));
}

criterion_group!(benches, benchmark_retention, benchmark_compression);
criterion_main!(benches);
