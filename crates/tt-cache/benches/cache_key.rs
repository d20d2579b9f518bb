use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::collections::BTreeMap;
use tt_cache::{ArgIdentity, CacheKey, ExecutableCache, LruConfig, SignatureKeyInput, build_cache_key};
use tt_core::{DType, Shape, ShapedArray};

fn signature(arity: usize) -> SignatureKeyInput {
    SignatureKeyInput {
        backend: "xla".to_owned(),
        policy: "retrace".to_owned(),
        without_host: true,
        compile_options: BTreeMap::new(),
        in_avals: (0..arity)
            .map(|_| ShapedArray::new(DType::F32, Shape::from(&[1_u32, 3, 3, 3][..])))
            .collect(),
        arg_identities: vec![ArgIdentity::Distinct; arity],
    }
}

fn bench_build_cache_key(c: &mut Criterion) {
    let single = signature(1);
    let wide = signature(16);
    c.bench_function("cache_key/one_arg", |b| {
        b.iter(|| build_cache_key(black_box(&single)).expect("key"))
    });
    c.bench_function("cache_key/sixteen_args", |b| {
        b.iter(|| build_cache_key(black_box(&wide)).expect("key"))
    });
}

fn bench_lru_hit(c: &mut Criterion) {
    let mut cache: ExecutableCache<u64> = ExecutableCache::new(LruConfig { max_entries: 16 });
    let keys: Vec<CacheKey> = (1..=16)
        .map(|arity| build_cache_key(&signature(arity)).expect("key"))
        .collect();
    for (idx, key) in keys.iter().enumerate() {
        cache.insert(key.clone(), idx as u64);
    }
    c.bench_function("executable_cache/hit_full", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(cache.get(key));
            }
        })
    });
}

criterion_group!(benches, bench_build_cache_key, bench_lru_hit);
criterion_main!(benches);
