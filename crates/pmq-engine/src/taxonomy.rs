use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Numbered domain table shown to the analyzer and scorer, plus where market
/// links point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub platform: String,
    pub link_base: String,
    pub domains: BTreeMap<u32, String>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        let domains = [
            "Sports: Soccer (Football)",
            "Sports: North American Leagues (NHL, MLB, NFL, NBA)",
            "Sports: Combat & eSports (Gaming, Fighting, Cricket)",
            "Cryptocurrency: Price (Immediate/Daily)",
            "Cryptocurrency: Products & Futures (Tokens, ETFs, Price Targets)",
            "Politics: U.S. Domestic & Legal",
            "Politics: Global & Military Conflict",
            "Technology & Business (Product Releases, AI, IPOs)",
            "Media & Entertainment (Awards, Celebs, Content Views)",
            "Finance & Economics (Earnings, Macro Indicators)",
            "Miscellaneous",
        ]
        .iter()
        .enumerate()
        .map(|(idx, name)| (idx as u32 + 1, name.to_string()))
        .collect();

        Self {
            platform: "Polymarket".to_string(),
            link_base: "https://polymarket.com/event/".to_string(),
            domains,
        }
    }
}

impl Taxonomy {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let taxonomy: Taxonomy = serde_yaml::from_str(text).context("parsing taxonomy yaml")?;
        anyhow::ensure!(!taxonomy.domains.is_empty(), "taxonomy defines no domains");
        Ok(taxonomy)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// The file at `path` when given, the built-in table otherwise.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => Ok(Self::default()),
        }
    }

    pub fn contains(&self, code: u32) -> bool {
        self.domains.contains_key(&code)
    }

    /// Domain labels for the given codes; unknown codes are skipped.
    pub fn domain_names(&self, codes: &[u32]) -> Vec<String> {
        let mut names = Vec::new();
        for code in codes {
            if let Some(name) = self.domains.get(code) {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// "1. Label" lines, indented by `indent` spaces.
    pub fn describe(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        self.domains
            .iter()
            .map(|(code, name)| format!("{pad}{code}. {name}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
