use crate::core::module::ModuleRecord;

/// Receives every published record update. Fire-and-forget: implementations must not
/// block the caller and have no way to report failure back.
pub trait PersistenceHook: Send + Sync + 'static {
    fn persist(&self, record: &ModuleRecord);
}
