// src/derivation.rs

//! In-memory derivations: build recipes with declared outputs and inputs.
//!
//! Parsing and printing the on-disk format is the store's business; the
//! scheduler only needs the structure, resolution of input derivations to
//! concrete paths, and a stable store path for a derivation it creates
//! itself (a resolved derivation).

use std::collections::{BTreeMap, BTreeSet};

use blake3::Hasher;

use crate::types::{OutputName, OutputPathMap, StorePath};

/// How an output's path is determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationOutput {
    /// Path fixed by the derivation's inputs.
    InputAddressed(StorePath),
    /// Path fixed by the expected content hash.
    Fixed { path: StorePath, hash: String },
    /// Content-addressed: the path is only known after building.
    Floating,
}

impl DerivationOutput {
    pub fn path(&self) -> Option<&StorePath> {
        match self {
            DerivationOutput::InputAddressed(path) => Some(path),
            DerivationOutput::Fixed { path, .. } => Some(path),
            DerivationOutput::Floating => None,
        }
    }

    pub fn ca(&self) -> Option<String> {
        match self {
            DerivationOutput::Fixed { hash, .. } => Some(format!("fixed:{hash}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub name: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub outputs: BTreeMap<OutputName, DerivationOutput>,
    /// Input derivations and the outputs needed from each.
    pub input_drvs: BTreeMap<StorePath, BTreeSet<OutputName>>,
    pub input_srcs: BTreeSet<StorePath>,
    /// Build locally even when a remote builder is available.
    pub prefer_local_build: bool,
    pub allow_substitutes: bool,
}

impl Derivation {
    pub fn new(name: impl Into<String>, builder: impl Into<String>) -> Self {
        Derivation {
            name: name.into(),
            builder: builder.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            outputs: BTreeMap::new(),
            input_drvs: BTreeMap::new(),
            input_srcs: BTreeSet::new(),
            prefer_local_build: false,
            allow_substitutes: true,
        }
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    /// Statically known output paths; floating outputs map to `None`.
    pub fn outputs_and_opt_paths(&self) -> OutputPathMap {
        self.outputs
            .iter()
            .map(|(name, out)| (name.clone(), out.path().cloned()))
            .collect()
    }

    pub fn has_floating_outputs(&self) -> bool {
        self.outputs
            .values()
            .any(|o| matches!(o, DerivationOutput::Floating))
    }

    pub fn is_fixed_output(&self) -> bool {
        !self.outputs.is_empty()
            && self
                .outputs
                .values()
                .all(|o| matches!(o, DerivationOutput::Fixed { .. }))
    }

    /// A derivation with no input derivations needs no further resolution.
    pub fn is_resolved(&self) -> bool {
        self.input_drvs.is_empty()
    }

    /// Placeholder a derivation embeds in its args/env to refer to an output
    /// of an input derivation whose path is not known yet.
    pub fn downstream_placeholder(drv_path: &StorePath, output: &str) -> String {
        let mut hasher = Hasher::new();
        hasher.update(b"upstream-output:");
        hasher.update(drv_path.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(output.as_bytes());
        format!("/{}", &hasher.finalize().to_hex()[..52])
    }

    /// Replace every input derivation output by its concrete path.
    ///
    /// `lookup` maps `(input drv, output)` to the realised path. Returns
    /// `None` as soon as one of them is unknown.
    pub fn try_resolve<F>(&self, mut lookup: F) -> Option<Derivation>
    where
        F: FnMut(&StorePath, &str) -> Option<StorePath>,
    {
        let mut resolved = self.clone();
        resolved.input_drvs.clear();

        let mut rewrites = BTreeMap::new();
        for (drv_path, outputs) in &self.input_drvs {
            for output in outputs {
                let path = lookup(drv_path, output)?;
                rewrites.insert(
                    Self::downstream_placeholder(drv_path, output),
                    path.to_string(),
                );
                resolved.input_srcs.insert(path);
            }
        }

        resolved.rewrite_strings(&rewrites);
        Some(resolved)
    }

    fn rewrite_strings(&mut self, rewrites: &BTreeMap<String, String>) {
        let apply = |s: &mut String| {
            for (from, to) in rewrites {
                if s.contains(from.as_str()) {
                    *s = s.replace(from.as_str(), to);
                }
            }
        };
        self.args.iter_mut().for_each(apply);
        self.env.values_mut().for_each(apply);
        let mut builder = std::mem::take(&mut self.builder);
        apply(&mut builder);
        self.builder = builder;
    }

    /// Store path of this derivation, derived from its contents.
    pub fn store_path(&self) -> StorePath {
        let mut hasher = Hasher::new();
        let mut field = |tag: &str, value: &str| {
            hasher.update(tag.as_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        };

        field("name", &self.name);
        field("builder", &self.builder);
        for arg in &self.args {
            field("arg", arg);
        }
        for (k, v) in &self.env {
            field("env", k);
            field("val", v);
        }
        for (name, out) in &self.outputs {
            field("out", name);
            match out {
                DerivationOutput::InputAddressed(p) => field("ia", p.as_str()),
                DerivationOutput::Fixed { path, hash } => {
                    field("fixed", path.as_str());
                    field("hash", hash);
                }
                DerivationOutput::Floating => field("floating", ""),
            }
        }
        for (drv, outputs) in &self.input_drvs {
            field("drv", drv.as_str());
            for o in outputs {
                field("drvout", o);
            }
        }
        for src in &self.input_srcs {
            field("src", src.as_str());
        }
        field("local", if self.prefer_local_build { "1" } else { "0" });
        field("subst", if self.allow_substitutes { "1" } else { "0" });

        let digest = hasher.finalize();
        StorePath::from_hash_and_name(&digest.to_hex()[..32], &format!("{}.drv", self.name))
    }
}
