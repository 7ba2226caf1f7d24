//! Property-Based Tests for Cache Coherence
//!
//! **Property: Read-after-write coherence**
//!
//! For any sequence of creates, updates and deletes of sound zones, every
//! read through the engine (by id, or through a registered ancestor finder)
//! SHALL return exactly what a direct store read returns at that point.

use std::collections::BTreeSet;

use keel_storage::{AncestorFinder, Query, Store};
use keel_test_utils::{
    Account, CacheConfig, Context, Entity, FinderRegistry, Identifier, SoundZone, TestEngine,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use serde_json::json;

const NAMES: [&str; 3] = ["lobby", "bar", "patio"];

#[derive(Debug, Clone)]
enum Op {
    Create(usize),
    Rename(usize, usize),
    Volume(usize, u8),
    Delete(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..NAMES.len()).prop_map(Op::Create),
        (any::<usize>(), 0..NAMES.len()).prop_map(|(i, n)| Op::Rename(i, n)),
        (any::<usize>(), any::<u8>()).prop_map(|(i, v)| Op::Volume(i, v)),
        any::<usize>().prop_map(Op::Delete),
    ]
}

async fn check_coherent(
    h: &TestEngine,
    finder: &AncestorFinder<SoundZone>,
    ctx: &Context,
    account: &Identifier,
    live: &[Identifier],
) -> Result<(), TestCaseError> {
    for name in NAMES {
        let cached: BTreeSet<Identifier> = finder
            .find(&h.engine, ctx, account, &[json!(name)])
            .await
            .map_err(|e| TestCaseError::fail(e.to_string()))?
            .into_iter()
            .map(|z| z.id)
            .collect();
        let query = Query::new(SoundZone::KIND)
            .ancestor(account.clone())
            .filter("name", json!(name));
        let direct: BTreeSet<Identifier> = h
            .store
            .query(&query)
            .await
            .map_err(|e| TestCaseError::fail(e.to_string()))?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        prop_assert_eq!(cached, direct, "finder result for {} is stale", name);
    }

    for id in live {
        let zone: SoundZone = h
            .engine
            .get(ctx, id)
            .await
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let stored = h.store.peek(id).unwrap().unwrap();
        prop_assert_eq!(json!(zone.name), stored["name"].clone());
        prop_assert_eq!(json!(zone.volume), stored["volume"].clone());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// **Property: Read-after-write coherence**
    #[test]
    fn prop_engine_reads_match_store(ops in proptest::collection::vec(op_strategy(), 1..25)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut registry = FinderRegistry::new();
            let finder = registry.register_ancestor_finder(&SoundZone::default(), &["name"]);
            let h = TestEngine::new(CacheConfig::default(), registry);
            let ctx = Context::new("coherence");

            let mut account = Account {
                name: "acme".to_string(),
                plan: "business".to_string(),
                ..Account::default()
            };
            h.engine.put(&ctx, &mut account).await.unwrap();
            let mut live: Vec<SoundZone> = Vec::new();

            for op in ops {
                match op {
                    Op::Create(n) => {
                        let mut zone = SoundZone {
                            id: Identifier::incomplete(SoundZone::KIND, Some(account.id.clone())),
                            name: NAMES[n].to_string(),
                            volume: 50,
                            loaded: false,
                        };
                        h.engine.put(&ctx, &mut zone).await.unwrap();
                        live.push(zone);
                    }
                    Op::Rename(i, n) if !live.is_empty() => {
                        let index = i % live.len();
                        live[index].name = NAMES[n].to_string();
                        h.engine.put(&ctx, &mut live[index]).await.unwrap();
                    }
                    Op::Volume(i, v) if !live.is_empty() => {
                        let index = i % live.len();
                        live[index].volume = v;
                        h.engine.put(&ctx, &mut live[index]).await.unwrap();
                    }
                    Op::Delete(i) if !live.is_empty() => {
                        let zone = live.remove(i % live.len());
                        h.engine.delete::<SoundZone>(&ctx, &zone.id).await.unwrap();
                    }
                    _ => {}
                }

                let ids: Vec<Identifier> = live.iter().map(|z| z.id.clone()).collect();
                check_coherent(&h, &finder, &ctx, &account.id, &ids).await?;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
