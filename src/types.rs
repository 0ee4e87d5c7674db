// src/types.rs

//! Store-level identifiers shared by goals, the worker and the
//! collaborators behind the `Store`/`Substituter`/executor traits.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Root of every store path.
pub const STORE_DIR: &str = "/nix/store";

/// Name of a derivation output (`out`, `dev`, `lib`, ...).
pub type OutputName = String;

/// A path in the store, e.g. `/nix/store/<hash>-hello-2.12`.
///
/// The scheduler only relies on the base name for display and on the
/// `.drv` suffix to recognise derivations; everything else is opaque.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(path: impl Into<String>) -> Self {
        StorePath(path.into())
    }

    pub fn from_hash_and_name(hash: &str, name: &str) -> Self {
        StorePath(format!("{STORE_DIR}/{hash}-{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component, `<hash>-<name>`.
    pub fn base_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// The human-readable part after the hash.
    pub fn name(&self) -> &str {
        let base = self.base_name();
        match base.split_once('-') {
            Some((_, name)) => name,
            None => base,
        }
    }

    pub fn is_derivation(&self) -> bool {
        self.0.ends_with(".drv")
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which outputs of a derivation a caller wants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputsSpec {
    All,
    Names(BTreeSet<OutputName>),
}

impl OutputsSpec {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OutputName>,
    {
        OutputsSpec::Names(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            OutputsSpec::All => true,
            OutputsSpec::Names(names) => names.contains(name),
        }
    }

    /// True if every output wanted by `self` is also wanted by `other`.
    pub fn is_subset_of(&self, other: &OutputsSpec) -> bool {
        match (self, other) {
            (_, OutputsSpec::All) => true,
            (OutputsSpec::All, OutputsSpec::Names(_)) => false,
            (OutputsSpec::Names(a), OutputsSpec::Names(b)) => a.is_subset(b),
        }
    }

    pub fn union(&self, other: &OutputsSpec) -> OutputsSpec {
        match (self, other) {
            (OutputsSpec::Names(a), OutputsSpec::Names(b)) => {
                OutputsSpec::Names(a.union(b).cloned().collect())
            }
            _ => OutputsSpec::All,
        }
    }

    /// Concrete output names, given the outputs a derivation declares.
    pub fn resolve<'a>(&self, declared: impl IntoIterator<Item = &'a str>) -> BTreeSet<OutputName> {
        match self {
            OutputsSpec::All => declared.into_iter().map(str::to_string).collect(),
            OutputsSpec::Names(names) => names.clone(),
        }
    }
}

impl fmt::Display for OutputsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputsSpec::All => f.write_str("*"),
            OutputsSpec::Names(names) => {
                let joined: Vec<&str> = names.iter().map(String::as_str).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

/// A reference to exactly one store object that may itself be a build
/// product: either an opaque path or an output of a (possibly dynamic)
/// derivation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SingleDerivedPath {
    Opaque(StorePath),
    Built {
        drv_path: Box<SingleDerivedPath>,
        output: OutputName,
    },
}

impl SingleDerivedPath {
    pub fn built(drv_path: SingleDerivedPath, output: impl Into<OutputName>) -> Self {
        SingleDerivedPath::Built {
            drv_path: Box::new(drv_path),
            output: output.into(),
        }
    }

    /// The store path at the bottom of the reference chain.
    pub fn base_path(&self) -> &StorePath {
        match self {
            SingleDerivedPath::Opaque(path) => path,
            SingleDerivedPath::Built { drv_path, .. } => drv_path.base_path(),
        }
    }

    /// Number of `^output` steps needed to reach a concrete path.
    pub fn depth(&self) -> usize {
        match self {
            SingleDerivedPath::Opaque(_) => 0,
            SingleDerivedPath::Built { drv_path, .. } => 1 + drv_path.depth(),
        }
    }
}

impl fmt::Display for SingleDerivedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SingleDerivedPath::Opaque(path) => write!(f, "{path}"),
            SingleDerivedPath::Built { drv_path, output } => write!(f, "{drv_path}^{output}"),
        }
    }
}

/// What a host asks the scheduler to realise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DerivedPath {
    Opaque(StorePath),
    Built {
        drv_path: SingleDerivedPath,
        outputs: OutputsSpec,
    },
}

impl DerivedPath {
    pub fn built(drv_path: StorePath, outputs: OutputsSpec) -> Self {
        DerivedPath::Built {
            drv_path: SingleDerivedPath::Opaque(drv_path),
            outputs,
        }
    }

    pub fn from_single(path: SingleDerivedPath) -> Self {
        match path {
            SingleDerivedPath::Opaque(path) => DerivedPath::Opaque(path),
            SingleDerivedPath::Built { drv_path, output } => DerivedPath::Built {
                drv_path: *drv_path,
                outputs: OutputsSpec::names([output]),
            },
        }
    }
}

impl fmt::Display for DerivedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivedPath::Opaque(path) => write!(f, "{path}"),
            DerivedPath::Built { drv_path, outputs } => write!(f, "{drv_path}^{outputs}"),
        }
    }
}

/// Identity of one output of one concrete derivation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrvOutput {
    pub drv_path: StorePath,
    pub output: OutputName,
}

impl DrvOutput {
    pub fn new(drv_path: StorePath, output: impl Into<OutputName>) -> Self {
        DrvOutput {
            drv_path,
            output: output.into(),
        }
    }
}

impl fmt::Display for DrvOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}^{}", self.drv_path, self.output)
    }
}

/// The value half of a build-trace entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnkeyedRealisation {
    pub out_path: StorePath,
    pub signatures: BTreeSet<String>,
}

impl UnkeyedRealisation {
    pub fn new(out_path: StorePath) -> Self {
        UnkeyedRealisation {
            out_path,
            signatures: BTreeSet::new(),
        }
    }
}

/// A build-trace entry: which path a derivation output produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realisation {
    pub id: DrvOutput,
    pub out_path: StorePath,
    pub signatures: BTreeSet<String>,
}

impl Realisation {
    pub fn new(id: DrvOutput, out_path: StorePath) -> Self {
        Realisation {
            id,
            out_path,
            signatures: BTreeSet::new(),
        }
    }

    pub fn keyed(id: DrvOutput, value: UnkeyedRealisation) -> Self {
        Realisation {
            id,
            out_path: value.out_path,
            signatures: value.signatures,
        }
    }

    pub fn unkeyed(&self) -> UnkeyedRealisation {
        UnkeyedRealisation {
            out_path: self.out_path.clone(),
            signatures: self.signatures.clone(),
        }
    }
}

/// Metadata of a store object, as held by a store or advertised by a
/// substituter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub path: StorePath,
    pub deriver: Option<StorePath>,
    pub references: BTreeSet<StorePath>,
    pub nar_size: u64,
    pub nar_hash: Option<String>,
    pub download_size: Option<u64>,
    /// `key-name:signature` strings.
    pub signatures: BTreeSet<String>,
    /// Content address, for content-addressed paths.
    pub ca: Option<String>,
}

impl PathInfo {
    pub fn new(path: StorePath) -> Self {
        PathInfo {
            path,
            deriver: None,
            references: BTreeSet::new(),
            nar_size: 0,
            nar_hash: None,
            download_size: None,
            signatures: BTreeSet::new(),
            ca: None,
        }
    }

    pub fn is_content_addressed(&self) -> bool {
        self.ca.is_some()
    }

    pub fn references_excluding_self(&self) -> impl Iterator<Item = &StorePath> {
        self.references.iter().filter(move |r| **r != self.path)
    }

    /// Number of signatures made by one of `trusted_keys`.
    pub fn check_signatures(&self, trusted_keys: &[String]) -> usize {
        self.signatures
            .iter()
            .filter_map(|sig| sig.split_once(':'))
            .filter(|(key, _)| trusted_keys.iter().any(|k| k == key))
            .count()
    }
}

/// Map from output names to paths where known.
pub type OutputPathMap = BTreeMap<OutputName, Option<StorePath>>;

/// How a derivation goal treats outputs that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum BuildMode {
    /// Skip valid outputs.
    #[default]
    Normal,
    /// Rebuild or re-fetch outputs (and their closure) whose contents are bad.
    Repair,
    /// Rebuild valid outputs and compare.
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_path_name_strips_hash() {
        let p = StorePath::from_hash_and_name("abc", "hello-2.12");
        assert_eq!(p.base_name(), "abc-hello-2.12");
        assert_eq!(p.name(), "hello-2.12");
        assert!(!p.is_derivation());
        assert!(StorePath::from_hash_and_name("abc", "hello.drv").is_derivation());
    }

    #[test]
    fn outputs_spec_subset_and_union() {
        let out = OutputsSpec::names(["out"]);
        let both = OutputsSpec::names(["out", "dev"]);
        assert!(out.is_subset_of(&both));
        assert!(!both.is_subset_of(&out));
        assert!(both.is_subset_of(&OutputsSpec::All));
        assert!(!OutputsSpec::All.is_subset_of(&both));
        assert_eq!(out.union(&OutputsSpec::names(["dev"])), both);
        assert_eq!(out.union(&OutputsSpec::All), OutputsSpec::All);
    }

    #[test]
    fn derived_path_display_and_depth() {
        let drv = StorePath::from_hash_and_name("aaa", "gen.drv");
        let inner = SingleDerivedPath::built(SingleDerivedPath::Opaque(drv.clone()), "out");
        assert_eq!(inner.depth(), 1);
        assert_eq!(inner.base_path(), &drv);
        assert_eq!(inner.to_string(), format!("{drv}^out"));

        let req = DerivedPath::Built {
            drv_path: inner,
            outputs: OutputsSpec::names(["dev", "out"]),
        };
        assert_eq!(req.to_string(), format!("{drv}^out^dev,out"));
    }

    #[test]
    fn signatures_are_matched_by_key_name() {
        let mut info = PathInfo::new(StorePath::from_hash_and_name("aaa", "x"));
        info.signatures.insert("cache-1:deadbeef".to_string());
        info.signatures.insert("other:cafe".to_string());
        assert_eq!(info.check_signatures(&["cache-1".to_string()]), 1);
        assert_eq!(info.check_signatures(&[]), 0);
    }
}
