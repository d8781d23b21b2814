use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stampede_cache::item::timestamp;
use stampede_cache::{CacheItem, DependencyContext, MemoryStore, Sources, early_expiration};

/// Counts how many of `trials` checks expire an entry `remaining` seconds before its expiry,
/// written `elapsed` seconds ago.
fn early_expirations(rng: &mut StdRng, remaining: f64, elapsed: f64, beta: f64, trials: usize) -> usize {
    let now = 1_700_000_000.0;
    (0..trials)
        .filter(|_| {
            let r = 1.0 - rng.random::<f64>();
            early_expiration(now + remaining, now - elapsed, now, beta, r)
        })
        .count()
}

#[test]
fn test_probability_increases_with_beta() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let counts: Vec<_> = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0]
        .into_iter()
        .map(|beta| early_expirations(&mut rng, 30.0, 20.0, beta, 20_000))
        .collect();

    for pair in counts.windows(2) {
        assert!(pair[0] < pair[1], "{counts:?}");
    }
    assert!(counts[0] > 0, "{counts:?}");
    assert!(counts[counts.len() - 1] < 20_000, "{counts:?}");
}

#[test]
fn test_probability_increases_towards_expiry() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let counts: Vec<_> = [60.0, 30.0, 10.0, 1.0]
        .into_iter()
        .map(|remaining| early_expirations(&mut rng, remaining, 20.0, 1.0, 20_000))
        .collect();

    for pair in counts.windows(2) {
        assert!(pair[0] < pair[1], "{counts:?}");
    }
}

#[test]
fn test_zero_beta_is_exact() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    assert_eq!(early_expirations(&mut rng, 0.001, 3600.0, 0.0, 20_000), 0);
}

#[test]
fn test_item_expiry_increases_with_beta() {
    stampede_test::setup();
    let store = MemoryStore::new();
    let sources = Sources::new();
    let ctx = DependencyContext::new(&store, &sources);

    let now = timestamp();
    let item = CacheItem::new("k", Some(now as i64 + 10), None).with_updated(now - 10.0);

    let trials = 2_000;
    let counts: Vec<_> = [0.5, 1.0, 2.0, 4.0]
        .into_iter()
        .map(|beta| {
            (0..trials)
                .filter(|_| item.expired(beta, &ctx).unwrap())
                .count()
        })
        .collect();

    for pair in counts.windows(2) {
        assert!(pair[0] < pair[1], "{counts:?}");
    }
    assert!(counts[counts.len() - 1] < trials, "{counts:?}");
    assert!((0..trials).all(|_| !item.expired(0.0, &ctx).unwrap()));
}
