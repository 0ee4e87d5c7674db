#![allow(dead_code)]

use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use realiser::derivation::{Derivation, DerivationOutput};
use realiser::types::{PathInfo, StorePath};

/// Deterministic 32-character fake hash of `seed`.
pub fn fake_hash(seed: &str) -> String {
    let mut a = DefaultHasher::new();
    seed.hash(&mut a);
    let mut b = DefaultHasher::new();
    (seed, "second half").hash(&mut b);
    format!("{:016x}{:016x}", a.finish(), b.finish())
}

/// A store path named `name` with a hash derived from the name.
pub fn store_path(name: &str) -> StorePath {
    StorePath::from_hash_and_name(&fake_hash(name), name)
}

/// Builder for [`PathInfo`] as a substituter would advertise it.
pub struct PathInfoBuilder {
    info: PathInfo,
}

impl PathInfoBuilder {
    pub fn new(path: &StorePath) -> Self {
        let mut info = PathInfo::new(path.clone());
        info.nar_size = 1024;
        info.download_size = Some(512);
        info.nar_hash = Some(format!("sha256:{}", fake_hash(path.as_str())));
        Self { info }
    }

    pub fn reference(mut self, path: &StorePath) -> Self {
        self.info.references.insert(path.clone());
        self
    }

    pub fn references<'a>(mut self, paths: impl IntoIterator<Item = &'a StorePath>) -> Self {
        self.info.references.extend(paths.into_iter().cloned());
        self
    }

    pub fn signed_by(mut self, key: &str) -> Self {
        self.info.signatures.insert(format!("{key}:c2lnbmF0dXJl"));
        self
    }

    pub fn content_addressed(mut self) -> Self {
        self.info.ca = Some(format!("fixed:r:sha256:{}", fake_hash(self.info.path.as_str())));
        self
    }

    pub fn deriver(mut self, drv_path: &StorePath) -> Self {
        self.info.deriver = Some(drv_path.clone());
        self
    }

    pub fn sizes(mut self, nar_size: u64, download_size: u64) -> Self {
        self.info.nar_size = nar_size;
        self.info.download_size = Some(download_size);
        self
    }

    pub fn build(self) -> PathInfo {
        self.info
    }
}

/// Signed path info with no references.
pub fn leaf_info(path: &StorePath, key: &str) -> PathInfo {
    PathInfoBuilder::new(path).signed_by(key).build()
}

/// Builder for [`Derivation`].
///
/// Input-addressed outputs get paths derived from the derivation name, so
/// the same builder calls always produce the same paths.
pub struct DerivationBuilder {
    drv: Derivation,
}

impl DerivationBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            drv: Derivation::new(name, "/bin/sh"),
        }
    }

    /// An input-addressed output at `output_path(name, output)`.
    pub fn output(mut self, output: &str) -> Self {
        let path = output_path(&self.drv.name, output);
        self.drv
            .outputs
            .insert(output.to_string(), DerivationOutput::InputAddressed(path));
        self
    }

    pub fn fixed_output(mut self, output: &str, hash: &str) -> Self {
        let path = output_path(&self.drv.name, output);
        self.drv.outputs.insert(
            output.to_string(),
            DerivationOutput::Fixed {
                path,
                hash: hash.to_string(),
            },
        );
        self
    }

    pub fn floating_output(mut self, output: &str) -> Self {
        self.drv
            .outputs
            .insert(output.to_string(), DerivationOutput::Floating);
        self
    }

    pub fn input_drv(mut self, drv_path: &StorePath, outputs: &[&str]) -> Self {
        self.drv
            .input_drvs
            .entry(drv_path.clone())
            .or_insert_with(BTreeSet::new)
            .extend(outputs.iter().map(|o| o.to_string()));
        self
    }

    pub fn input_src(mut self, path: &StorePath) -> Self {
        self.drv.input_srcs.insert(path.clone());
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.drv.args.push(arg.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.drv.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn builder(mut self, builder: &str) -> Self {
        self.drv.builder = builder.to_string();
        self
    }

    pub fn prefer_local_build(mut self) -> Self {
        self.drv.prefer_local_build = true;
        self
    }

    pub fn no_substitutes(mut self) -> Self {
        self.drv.allow_substitutes = false;
        self
    }

    pub fn build(self) -> Derivation {
        self.drv
    }
}

/// Path of an input-addressed output as produced by [`DerivationBuilder`].
pub fn output_path(drv_name: &str, output: &str) -> StorePath {
    if output == "out" {
        store_path(drv_name)
    } else {
        store_path(&format!("{drv_name}-{output}"))
    }
}
