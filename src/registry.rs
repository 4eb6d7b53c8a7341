//! Named model-variant registry.
//!
//! Maps variant names to configuration presets so external tooling (the CLI,
//! experiment scripts) can select a model by name. Populated once at first
//! use; not part of the computational core.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::config::{CodeFormerConfig, PositionKind, RefinementKind};

type ConfigFn = fn() -> CodeFormerConfig;

static REGISTRY: OnceLock<HashMap<&'static str, ConfigFn>> = OnceLock::new();

fn registry() -> &'static HashMap<&'static str, ConfigFn> {
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, ConfigFn> = HashMap::new();
        map.insert("codeformer", CodeFormerConfig::default);
        map.insert("codeformer-512", || CodeFormerConfig {
            dim_embd: 512,
            ..CodeFormerConfig::default()
        });
        map.insert("codeformer-sine", || CodeFormerConfig {
            position: PositionKind::Sine,
            ..CodeFormerConfig::default()
        });
        map.insert("codeformer-adain", || CodeFormerConfig {
            refinement: RefinementKind::AdaIn,
            ..CodeFormerConfig::default()
        });
        map.insert("codeformer-fuse", || CodeFormerConfig {
            refinement: RefinementKind::FuseSft,
            ..CodeFormerConfig::default()
        });
        map
    })
}

/// Look up a variant's configuration preset by name.
pub fn variant(name: &str) -> Option<CodeFormerConfig> {
    registry().get(name).map(|build| build())
}

/// All registered variant names, sorted.
pub fn variant_names() -> Vec<&'static str> {
    let mut names: Vec<_> = registry().keys().copied().collect();
    names.sort_unstable();
    names
}
