/// Names the field of a typed object that an address falls in
pub trait TypeResolver {
    /// Describe `base + offset`, where `base` is the start of an object of
    /// type `type_name`. `pc_hint` is the pc that touched the address, or 0.
    fn describe(&self, type_name: &str, base: u64, offset: u64, pc_hint: u64) -> String;
}

/// Fallback when no type metadata is available: `type+0xoffset`
#[derive(Debug, Default, Clone, Copy)]
pub struct OffsetTypeResolver;

impl TypeResolver for OffsetTypeResolver {
    fn describe(&self, type_name: &str, _base: u64, offset: u64, _pc_hint: u64) -> String {
        format!("{type_name}+{offset:#x}")
    }
}
