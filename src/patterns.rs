//! Project conventions derived from the indexed models.
//!
//! For every layer that has models: the name prefixes in use, a naming
//! template built from them, a representative example and the most common
//! materialization. Capsules carry these so new models follow the project's
//! existing shape.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{Layer, Model};
use crate::snapshot::GraphSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerConvention {
    pub layer: Layer,
    pub model_count: usize,
    /// Name prefixes such as `stg_`, most used first.
    pub prefixes: Vec<String>,
    /// Template such as `stg_{source}__{entity}`.
    pub naming: Option<String>,
    pub example: Option<String>,
    pub materialization: Option<String>,
}

/// Leading segment of `name` up to and including the first underscore.
fn name_prefix(name: &str) -> Option<&str> {
    match name.find('_') {
        Some(end) if end > 0 => Some(&name[..=end]),
        _ => None,
    }
}

/// Highest count wins; ties go to the smaller key.
fn most_common<'a>(counts: &BTreeMap<&'a str, usize>) -> Option<&'a str> {
    counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(key, _)| *key)
}

fn layer_convention(layer: Layer, models: &[&Model]) -> LayerConvention {
    let mut prefix_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut materializations: BTreeMap<&str, usize> = BTreeMap::new();
    for m in models {
        if let Some(prefix) = name_prefix(&m.name) {
            *prefix_counts.entry(prefix).or_default() += 1;
        }
        if !m.materialization.is_empty() {
            *materializations.entry(m.materialization.as_str()).or_default() += 1;
        }
    }

    // A prefix is a convention when it is shared or names the layer itself.
    let keywords = layer.keywords();
    let mut ranked: Vec<(&str, usize)> = prefix_counts
        .into_iter()
        .filter(|(prefix, n)| *n >= 2 || keywords.contains(&prefix.trim_end_matches('_')))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let prefixes: Vec<String> = ranked.into_iter().map(|(p, _)| p.to_string()).collect();

    let conventional: Vec<&Model> = models
        .iter()
        .copied()
        .filter(|m| prefixes.iter().any(|p| m.name.starts_with(p.as_str())))
        .collect();
    let double_underscore = !conventional.is_empty()
        && conventional.iter().filter(|m| m.name.contains("__")).count() * 2 > conventional.len();
    let naming = (!prefixes.is_empty()).then(|| {
        prefixes
            .iter()
            .map(|p| {
                if double_underscore {
                    format!("{}{{source}}__{{entity}}", p)
                } else {
                    format!("{}{{entity}}", p)
                }
            })
            .collect::<Vec<_>>()
            .join(" | ")
    });

    let candidates: &[&Model] = if conventional.is_empty() {
        models
    } else {
        &conventional
    };
    let example = candidates
        .iter()
        .max_by(|a, b| {
            a.centrality
                .total_cmp(&b.centrality)
                .then_with(|| b.name.cmp(&a.name))
        })
        .map(|m| m.name.clone());

    LayerConvention {
        layer,
        model_count: models.len(),
        prefixes,
        naming,
        example,
        materialization: most_common(&materializations).map(String::from),
    }
}

/// Conventions for each populated layer, in layer order.
pub fn project_patterns(snapshot: &GraphSnapshot) -> Vec<LayerConvention> {
    let mut by_layer: BTreeMap<Layer, Vec<&Model>> = BTreeMap::new();
    for m in snapshot.models.values() {
        by_layer.entry(m.layer).or_default().push(m);
    }
    Layer::ALL
        .iter()
        .filter_map(|layer| {
            by_layer
                .get(layer)
                .map(|models| layer_convention(*layer, models))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CentralityConfig;
    use crate::models::{test_model, Edge};
    use crate::snapshot::StagedGraph;

    fn snapshot(models: &[(&str, Layer, &str)], edges: &[(&str, &str)]) -> GraphSnapshot {
        let mut staged = StagedGraph::default();
        for (name, layer, materialization) in models {
            let mut m = test_model(&format!("model.p.{}", name), name);
            m.layer = *layer;
            m.materialization = materialization.to_string();
            staged.models.insert(m.unique_id.clone(), m);
        }
        for (parent, child) in edges {
            staged.edges.insert(Edge::new(
                format!("model.p.{}", parent),
                format!("model.p.{}", child),
            ));
        }
        GraphSnapshot::publish(staged, None, None, &CentralityConfig::default(), 1)
    }

    #[test]
    fn test_name_prefix() {
        assert_eq!(name_prefix("stg_orders"), Some("stg_"));
        assert_eq!(name_prefix("customers"), None);
        assert_eq!(name_prefix("_tmp"), None);
        assert_eq!(name_prefix("épice_x"), Some("épice_"));
    }

    #[test]
    fn test_conventions_per_layer() {
        let snap = snapshot(
            &[
                ("stg_stripe__payments", Layer::Staging, "view"),
                ("stg_stripe__refunds", Layer::Staging, "view"),
                ("int_payments_joined", Layer::Intermediate, "ephemeral"),
                ("fct_orders", Layer::Marts, "table"),
                ("dim_customers", Layer::Marts, "table"),
                ("revenue_daily", Layer::Marts, "view"),
            ],
            &[
                ("stg_stripe__payments", "int_payments_joined"),
                ("stg_stripe__refunds", "int_payments_joined"),
                ("int_payments_joined", "fct_orders"),
                ("dim_customers", "fct_orders"),
            ],
        );
        let patterns = project_patterns(&snap);
        let layers: Vec<Layer> = patterns.iter().map(|p| p.layer).collect();
        assert_eq!(layers, vec![Layer::Staging, Layer::Intermediate, Layer::Marts]);

        let staging = &patterns[0];
        assert_eq!(staging.model_count, 2);
        assert_eq!(staging.prefixes, vec!["stg_"]);
        assert_eq!(staging.naming.as_deref(), Some("stg_{source}__{entity}"));
        assert_eq!(staging.materialization.as_deref(), Some("view"));

        let intermediate = &patterns[1];
        assert_eq!(intermediate.naming.as_deref(), Some("int_{entity}"));
        assert_eq!(intermediate.example.as_deref(), Some("int_payments_joined"));
        assert_eq!(intermediate.materialization.as_deref(), Some("ephemeral"));

        let marts = &patterns[2];
        assert_eq!(marts.prefixes, vec!["dim_", "fct_"]);
        assert_eq!(marts.naming.as_deref(), Some("dim_{entity} | fct_{entity}"));
        assert_eq!(marts.example.as_deref(), Some("fct_orders"));
        assert_eq!(marts.materialization.as_deref(), Some("table"));
    }

    #[test]
    fn test_layer_without_convention() {
        let snap = snapshot(
            &[
                ("revenue_daily", Layer::Marts, "table"),
                ("customers", Layer::Marts, "view"),
            ],
            &[],
        );
        let patterns = project_patterns(&snap);
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].prefixes.is_empty());
        assert_eq!(patterns[0].naming, None);
        assert_eq!(patterns[0].example.as_deref(), Some("customers"));
        assert_eq!(patterns[0].materialization.as_deref(), Some("table"));

        assert!(project_patterns(&GraphSnapshot::default()).is_empty());
    }
}
