//! Candidate search, scoring, and selection.
//!
//! Fans out searches across the enabled providers, scores every candidate
//! against the input record, and produces a [`Selection`]: one primary
//! plus an ordered fallback list the scheduler walks on failure.
//!
//! Ranking is deterministic: total score descending, ties broken by the
//! provider's position in `selection.provider_hierarchy`, remaining ties
//! by `source_id` lexicographic order.

use std::cmp::Ordering;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, SelectionStrategy};
use crate::matching::{creator_score, title_score};
use crate::model::{
    Candidate, InputRecord, RejectedCandidate, ScoredCandidate, Scores, Selection,
};
use crate::net::HttpExecutor;
use crate::provider::{ProviderAdapter, ProviderRegistry};

/// Quality bonus for a directly known IIIF manifest.
const IIIF_BONUS: f64 = 3.0;
/// Quality bonus for a landing page URL.
const ITEM_URL_BONUS: f64 = 0.5;

/// Everything the selector learned about one input record.
#[derive(Debug, Clone)]
pub struct SelectorOutput {
    /// All scored candidates, in provider order, for the journal.
    pub candidates: Vec<ScoredCandidate>,
    /// Candidates rejected by the title threshold.
    pub rejected: Vec<RejectedCandidate>,
    /// The selection, absent when nothing passed the threshold.
    pub selection: Option<Selection>,
}

/// Scores one candidate against the query.
#[must_use]
pub fn score_candidate(
    candidate: &Candidate,
    query_title: &str,
    query_creator: Option<&str>,
    creator_weight: f64,
) -> Scores {
    let ts = title_score(query_title, &candidate.title);
    let cs = creator_score(query_creator, &candidate.creators);
    let mut quality_bonus = 0.0;
    if candidate.iiif_manifest_url.is_some() {
        quality_bonus += IIIF_BONUS;
    }
    if candidate.item_url.is_some() {
        quality_bonus += ITEM_URL_BONUS;
    }
    let weight = creator_weight.clamp(0.0, 1.0);
    let total = f64::from(ts) * (1.0 - weight) + f64::from(cs) * weight + quality_bonus;
    Scores {
        title_score: ts,
        creator_score: cs,
        quality_bonus,
        total,
    }
}

fn hierarchy_position(hierarchy: &[String], provider_key: &str) -> usize {
    hierarchy
        .iter()
        .position(|k| k == provider_key)
        .unwrap_or(usize::MAX)
}

/// Deterministic ranking comparator: total desc, hierarchy position asc,
/// source id asc.
fn rank_cmp(hierarchy: &[String], a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.scores
        .total
        .partial_cmp(&a.scores.total)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            hierarchy_position(hierarchy, &a.candidate.provider_key)
                .cmp(&hierarchy_position(hierarchy, &b.candidate.provider_key))
        })
        .then_with(|| a.candidate.source_id.cmp(&b.candidate.source_id))
}

/// Candidate selector over the enabled provider set.
pub struct Selector {
    config: Config,
    registry: Arc<ProviderRegistry>,
    executor: Arc<HttpExecutor>,
}

impl Selector {
    /// Creates a selector.
    #[must_use]
    pub fn new(config: Config, registry: Arc<ProviderRegistry>, executor: Arc<HttpExecutor>) -> Self {
        Self {
            config,
            registry,
            executor,
        }
    }

    /// Runs the configured strategy for one input record.
    #[instrument(skip(self), fields(entry_id = %input.entry_id, title = %input.title))]
    pub async fn select(&self, input: &InputRecord) -> SelectorOutput {
        let adapters = self.registry.enabled_adapters(&self.config);
        if adapters.is_empty() {
            warn!("no providers enabled");
            return SelectorOutput {
                candidates: Vec::new(),
                rejected: Vec::new(),
                selection: None,
            };
        }

        match self.config.selection.strategy {
            SelectionStrategy::CollectAndSelect => self.collect_and_select(input, adapters).await,
            SelectionStrategy::SequentialFirstHit => {
                self.sequential_first_hit(input, adapters).await
            }
        }
    }

    async fn search_one(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        input: &InputRecord,
    ) -> Vec<ScoredCandidate> {
        let key = adapter.info().key;
        let max_results = self.config.max_results(key);
        let results = adapter
            .search(
                &self.executor,
                &input.title,
                input.creator.as_deref(),
                max_results,
            )
            .await;

        match results {
            Ok(candidates) => {
                if candidates.is_empty() {
                    info!(provider = key, "no items found");
                } else {
                    info!(provider = key, count = candidates.len(), "found items");
                }
                candidates
                    .into_iter()
                    .take(max_results)
                    .map(|candidate| {
                        let scores = score_candidate(
                            &candidate,
                            &input.title,
                            input.creator.as_deref(),
                            self.config.selection.creator_weight,
                        );
                        ScoredCandidate { candidate, scores }
                    })
                    .collect()
            }
            Err(error) => {
                warn!(provider = key, %error, "search failed");
                Vec::new()
            }
        }
    }

    async fn collect_and_select(
        &self,
        input: &InputRecord,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
    ) -> SelectorOutput {
        let parallelism = self.config.selection.max_parallel_searches.max(1);
        let keys: Vec<&'static str> = adapters.iter().map(|a| a.info().key).collect();

        // Fan out bounded by max_parallel_searches, then reassemble in
        // provider order so the journal stays deterministic.
        let mut by_provider: std::collections::HashMap<&'static str, Vec<ScoredCandidate>> =
            stream::iter(adapters.into_iter().map(|adapter| {
                let key = adapter.info().key;
                async move { (key, self.search_one(adapter, input).await) }
            }))
            .buffer_unordered(parallelism)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect();

        let mut candidates = Vec::new();
        for key in keys {
            if let Some(list) = by_provider.remove(key) {
                candidates.extend(list);
            }
        }

        self.rank(input, candidates)
    }

    async fn sequential_first_hit(
        &self,
        input: &InputRecord,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
    ) -> SelectorOutput {
        let mut all = Vec::new();
        let mut rejected = Vec::new();
        let mut selection = None;

        for adapter in adapters {
            let key = adapter.info().key;
            let scored = self.search_one(adapter, input).await;
            let threshold = self.config.min_title_score(key);

            let mut passing: Vec<ScoredCandidate> = Vec::new();
            for sc in &scored {
                if f64::from(sc.scores.title_score) >= threshold {
                    passing.push(sc.clone());
                } else {
                    rejected.push(RejectedCandidate {
                        provider_key: sc.candidate.provider_key.clone(),
                        source_id: sc.candidate.source_id.clone(),
                        reason: format!(
                            "title score {} below threshold {threshold}",
                            sc.scores.title_score
                        ),
                    });
                }
            }
            all.extend(scored);

            passing.sort_by(|a, b| rank_cmp(&self.config.selection.provider_hierarchy, a, b));
            let mut iter = passing.into_iter();
            if let Some(primary) = iter.next() {
                debug!(
                    provider = key,
                    source_id = %primary.candidate.source_id,
                    total = primary.scores.total,
                    "first acceptable hit"
                );
                selection = Some(Selection {
                    primary,
                    fallbacks: iter.collect(),
                    rejected: rejected.clone(),
                });
                break;
            }
        }

        SelectorOutput {
            candidates: all,
            rejected,
            selection,
        }
    }

    fn rank(&self, input: &InputRecord, candidates: Vec<ScoredCandidate>) -> SelectorOutput {
        let hierarchy = &self.config.selection.provider_hierarchy;
        let mut passing = Vec::new();
        let mut rejected = Vec::new();

        for sc in &candidates {
            let threshold = self.config.min_title_score(&sc.candidate.provider_key);
            if f64::from(sc.scores.title_score) >= threshold {
                passing.push(sc.clone());
            } else {
                rejected.push(RejectedCandidate {
                    provider_key: sc.candidate.provider_key.clone(),
                    source_id: sc.candidate.source_id.clone(),
                    reason: format!(
                        "title score {} below threshold {threshold}",
                        sc.scores.title_score
                    ),
                });
            }
        }

        passing.sort_by(|a, b| rank_cmp(hierarchy, a, b));

        let mut iter = passing.into_iter();
        let selection = iter.next().map(|primary| {
            info!(
                provider = %primary.candidate.provider_key,
                source_id = %primary.candidate.source_id,
                total = primary.scores.total,
                "selected primary candidate"
            );
            Selection {
                primary,
                fallbacks: iter.collect(),
                rejected: rejected.clone(),
            }
        });
        if selection.is_none() {
            info!(entry_id = %input.entry_id, "no acceptable candidates");
        }

        SelectorOutput {
            candidates,
            rejected,
            selection,
        }
    }
}
