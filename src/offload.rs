//! Offload-entry registration: the metadata the host-side offload table is
//! built from.

use std::collections::HashSet;

use serde::Serialize;

use crate::{
    error::{ErrorKind, Result},
    ir::{sanitize_symbol, AddressSpace, Constant, FuncId, Global, Linkage, Module},
};

/// Section collected by the host linker into the offload table.
pub const OFFLOAD_ENTRIES_SECTION: &str = "omp_offloading_entries";

const ENTRY_SYMBOL_PREFIX: &str = ".omp_offloading.entry.";

/// Name under which the host finds the device function of a target region.
///
/// The file is identified by the low 32 bits of its seahash, and templated
/// or otherwise exotic parent names are sanitized to a valid symbol.
#[must_use]
pub fn offload_entry_name(device_id: u32, file: &str, parent_name: &str, line: u32) -> String {
    #[expect(clippy::cast_possible_truncation)]
    let file_id = seahash::hash(file.as_bytes()) as u32;

    format!(
        "__omp_offloading_{device_id:x}_{file_id:x}_{}_l{line}",
        sanitize_symbol(parent_name)
    )
}

/// One row of the offload table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OffloadEntry {
    /// The entry name, see [`offload_entry_name`].
    pub name: String,
    /// The metadata global holding `(address, size, flags)`.
    pub symbol: String,
    /// The registered function.
    #[serde(skip)]
    pub address: FuncId,
    /// Zero for functions.
    pub size: u64,
    /// Always zero; no flags are defined.
    pub flags: u32,
}

/// The offload entries of one module, in registration order.
#[derive(Clone, Debug, Default, Serialize)]
pub struct OffloadEntryRegistry {
    entries: Vec<OffloadEntry>,
    #[serde(skip)]
    names: HashSet<String>,
}

impl OffloadEntryRegistry {
    #[must_use]
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `name` and emits its metadata global into `module`.
    ///
    /// Registering the same name twice is an internal error.
    pub fn register_entry(
        &mut self,
        module: &mut Module,
        name: &str,
        address: FuncId,
        size: u64,
    ) -> Result<()> {
        if !self.names.insert(name.to_owned()) {
            crate::bail!(ErrorKind::DuplicateOffloadEntry(name.to_owned()));
        }

        let symbol = format!("{ENTRY_SYMBOL_PREFIX}{name}");
        #[expect(clippy::cast_possible_wrap)]
        let init = vec![
            Constant::Function(address),
            Constant::Int(size as i64),
            Constant::Int(0),
        ];
        module.add_global(Global {
            name: symbol.clone(),
            space: AddressSpace::Global,
            linkage: Linkage::External,
            slots: 3,
            init,
            section: Some(String::from(OFFLOAD_ENTRIES_SECTION)),
        })?;

        tracing::debug!(entry = name, symbol = %symbol, "registered offload entry");

        self.entries.push(OffloadEntry {
            name: name.to_owned(),
            symbol,
            address,
            size,
            flags: 0,
        });

        Ok(())
    }

    /// Entries in registration order.
    #[must_use]
    pub fn entries(&self) -> &[OffloadEntry] {
        &self.entries
    }

    /// Looks up an entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OffloadEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    #[must_use]
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The table as JSON, for host-side consumers.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| {
            ErrorKind::InternalError(format!("cannot serialize the offload table: {err}")).into()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{offload_entry_name, OffloadEntryRegistry, OFFLOAD_ENTRIES_SECTION};
    use crate::{
        error::ErrorKind,
        ir::{is_valid_symbol, FunctionKind, Linkage, Module},
    };

    #[test]
    fn entry_names_encode_the_region() {
        let name = offload_entry_name(0x10, "reduction.cpp", "main", 27);
        assert!(name.starts_with("__omp_offloading_10_"));
        assert!(name.ends_with("_main_l27"));
        assert!(is_valid_symbol(&name));

        assert_eq!(name, offload_entry_name(0x10, "reduction.cpp", "main", 27));
        assert_ne!(name, offload_entry_name(0x10, "other.cpp", "main", 27));

        let templated = offload_entry_name(0, "t.cpp", "tmain<int, 5>", 3);
        assert!(templated.ends_with("_tmain_int_5__l3"));
    }

    #[test]
    fn duplicate_entries_are_internal_errors() {
        let mut module = Module::new("m", "nvptx64-nvidia-cuda");
        let kernel = module
            .declare_function("k", FunctionKind::Kernel, Linkage::External, Vec::new())
            .unwrap();

        let mut registry = OffloadEntryRegistry::new();
        registry.register_entry(&mut module, "k", kernel, 0).unwrap();

        let err = registry
            .register_entry(&mut module, "k", kernel, 0)
            .unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.kind(), &ErrorKind::DuplicateOffloadEntry(String::from("k")));
        assert_eq!(registry.len(), 1);

        let global = module
            .global(module.global_by_name(".omp_offloading.entry.k").unwrap())
            .unwrap();
        assert_eq!(global.section.as_deref(), Some(OFFLOAD_ENTRIES_SECTION));
    }

    #[test]
    fn registry_serializes_to_json() {
        let mut module = Module::new("m", "nvptx64-nvidia-cuda");
        let kernel = module
            .declare_function("k", FunctionKind::Kernel, Linkage::External, Vec::new())
            .unwrap();
        let mut registry = OffloadEntryRegistry::new();
        registry.register_entry(&mut module, "k", kernel, 0).unwrap();

        let json: serde_json::Value = serde_json::from_str(&registry.to_json().unwrap()).unwrap();
        assert_eq!(json["entries"][0]["name"], "k");
        assert_eq!(json["entries"][0]["symbol"], ".omp_offloading.entry.k");
        assert_eq!(json["entries"][0]["size"], 0);
    }
}
