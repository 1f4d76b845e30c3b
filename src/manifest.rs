//! JSON package manifests
//!
//! The `pack` command builds package files from a manifest such as:
//!
//! ```json
//! {
//!   "packages": [
//!     {
//!       "name": "/Game/Props/Door",
//!       "imports": [
//!         { "package": "/Game/Props/Hinge" },
//!         { "class_name": "Mesh", "object": "Hinge", "outer": "import:0" }
//!       ],
//!       "exports": [
//!         { "name": "Door", "payload": "oak", "create_before_create": ["import:1"] }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Table references are written `import:N` or `export:N`; a missing
//! reference is null.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runtime::format::{export_flags, package_file_path, ExportSpec, ImportEntry, PackageIndex, PackageWriter};
use crate::runtime::scheduler::validate_package_name;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub packages: Vec<PackageManifest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    #[serde(default)]
    pub guid: Option<u128>,
    #[serde(default)]
    pub imports: Vec<ImportManifest>,
    #[serde(default)]
    pub exports: Vec<ExportManifest>,
}

/// Either a whole package (`package`) or an object inside an earlier import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportManifest {
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub class_package: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub outer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub name: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default, rename = "super")]
    pub super_class: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub outer: Option<String>,
    /// `public`, `default_object`, `class` or `deprecated`; `public` when empty.
    #[serde(default)]
    pub flags: Vec<String>,
    /// Payload bytes, taken as UTF-8 text.
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub gap: u64,
    #[serde(default)]
    pub serialize_before_serialize: Vec<String>,
    #[serde(default)]
    pub create_before_serialize: Vec<String>,
    #[serde(default)]
    pub serialize_before_create: Vec<String>,
    #[serde(default)]
    pub create_before_create: Vec<String>,
}

/// Parse `import:N`, `export:N` or `null`.
pub fn parse_index(text: &str) -> Result<PackageIndex> {
    let text = text.trim();
    if text.is_empty() || text == "null" {
        return Ok(PackageIndex::Null);
    }
    let (kind, number) = text
        .split_once(':')
        .ok_or_else(|| anyhow!("bad table reference '{}': expected import:N or export:N", text))?;
    let index: u32 = number
        .parse()
        .with_context(|| format!("bad index in table reference '{}'", text))?;
    match kind {
        "import" => Ok(PackageIndex::Import(index)),
        "export" => Ok(PackageIndex::Export(index)),
        _ => bail!("unknown table '{}' in reference '{}'", kind, text),
    }
}

fn parse_optional(text: &Option<String>) -> Result<PackageIndex> {
    match text {
        Some(text) => parse_index(text),
        None => Ok(PackageIndex::Null),
    }
}

fn parse_flags(names: &[String]) -> Result<u32> {
    if names.is_empty() {
        return Ok(export_flags::PUBLIC);
    }
    names.iter().try_fold(0, |flags, name| {
        let bit = match name.as_str() {
            "public" => export_flags::PUBLIC,
            "default_object" => export_flags::DEFAULT_OBJECT,
            "class" => export_flags::CLASS,
            "deprecated" => export_flags::DEPRECATED,
            other => bail!("unknown export flag '{}'", other),
        };
        Ok(flags | bit)
    })
}

impl ImportManifest {
    fn to_entry(&self) -> Result<ImportEntry> {
        if let Some(package) = &self.package {
            validate_package_name(package)?;
            return Ok(ImportEntry::package(package.clone()));
        }
        let class_name = self.class_name.clone().context("object import needs 'class_name'")?;
        let object = self.object.clone().context("object import needs 'object'")?;
        let outer = parse_optional(&self.outer)?;
        if outer.as_import().is_none() {
            bail!("object import '{}' needs an 'outer' import", object);
        }
        let class_package = self.class_package.clone().unwrap_or_else(|| "/Script/Core".to_string());
        Ok(ImportEntry::object(class_package, class_name, object, outer))
    }
}

impl ExportManifest {
    fn to_spec(&self) -> Result<ExportSpec> {
        let mut spec = ExportSpec::new(self.name.clone(), parse_optional(&self.class)?, self.payload.as_bytes())
            .with_super(parse_optional(&self.super_class)?)
            .with_template(parse_optional(&self.template)?)
            .with_outer(parse_optional(&self.outer)?)
            .with_flags(parse_flags(&self.flags)?)
            .with_gap(self.gap);
        for dep in &self.serialize_before_serialize {
            spec = spec.serialize_before_serialize(parse_index(dep)?);
        }
        for dep in &self.create_before_serialize {
            spec = spec.create_before_serialize(parse_index(dep)?);
        }
        for dep in &self.serialize_before_create {
            spec = spec.serialize_before_create(parse_index(dep)?);
        }
        for dep in &self.create_before_create {
            spec = spec.create_before_create(parse_index(dep)?);
        }
        Ok(spec)
    }
}

impl PackageManifest {
    /// Encode the package file.
    pub fn build(&self) -> Result<Vec<u8>> {
        validate_package_name(&self.name)?;
        let mut writer = PackageWriter::new().with_guid(self.guid.unwrap_or(0));
        for (i, import) in self.imports.iter().enumerate() {
            let entry = import
                .to_entry()
                .with_context(|| format!("import {} of '{}'", i, self.name))?;
            writer.add_import(entry);
        }
        for export in &self.exports {
            let spec = export
                .to_spec()
                .with_context(|| format!("export '{}' of '{}'", export.name, self.name))?;
            writer.add_export(spec);
        }
        writer
            .finish()
            .with_context(|| format!("failed to encode '{}'", self.name))
    }
}

impl Manifest {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("invalid package manifest")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Write every package below `out_dir`. Returns the files written.
    pub fn write_all(
        &self,
        out_dir: &Path,
        extension: &str,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(self.packages.len());
        for package in &self.packages {
            let bytes = package.build()?;
            let relative = package_file_path(&package.name, extension);
            let path = out_dir.join(relative.trim_start_matches('/'));
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
            }
            fs::write(&path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
            debug!(package = %package.name, bytes = bytes.len(), path = %path.display(), "package written");
            written.push(path);
        }
        Ok(written)
    }
}

/// Package name for a file found below `root`, if it has `extension`.
pub fn package_name_for(
    root: &Path,
    file: &Path,
    extension: &str,
) -> Option<String> {
    if file.extension()? != extension {
        return None;
    }
    let relative = file.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(format!("/{}", parts.join("/")))
}
