use crate::{errors::ErrorCode, XArray};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Handle ID type - safer than raw pointers
pub type HandleId = u64;

/// Containers reachable from C hold value entries only.
pub type ValueArray = XArray<()>;

/// Global handle registry for arrays opened through the C ABI
struct HandleRegistry {
    handles: Mutex<HashMap<HandleId, Arc<ValueArray>>>,
    next_id: AtomicU64,
}

impl HandleRegistry {
    fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1), // Start from 1, reserve 0 for null/invalid
        }
    }

    fn register(&self, xa: ValueArray) -> Result<HandleId, ErrorCode> {
        let handle_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut handles = self.handles.lock().map_err(|_| ErrorCode::Unknown)?;
        handles.insert(handle_id, Arc::new(xa));
        Ok(handle_id)
    }

    /// Clone the array out so the map lock is not held across the call.
    fn get(&self, handle_id: HandleId) -> Result<Arc<ValueArray>, ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        let handles = self.handles.lock().map_err(|_| ErrorCode::InvalidHandle)?;
        handles.get(&handle_id).cloned().ok_or(ErrorCode::InvalidHandle)
    }

    fn unregister(&self, handle_id: HandleId) -> Result<(), ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        let mut handles = self.handles.lock().map_err(|_| ErrorCode::InvalidHandle)?;
        if handles.remove(&handle_id).is_some() {
            Ok(())
        } else {
            Err(ErrorCode::InvalidHandle)
        }
    }
}

static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();

fn get_registry() -> &'static HandleRegistry {
    REGISTRY.get_or_init(HandleRegistry::new)
}

pub fn register_handle(xa: ValueArray) -> Result<HandleId, ErrorCode> {
    get_registry().register(xa)
}

/// Run `f` against the array behind `handle_id`. A concurrent close only
/// drops the array once `f` has returned.
pub fn with_handle<R, F>(handle_id: HandleId, f: F) -> Result<R, ErrorCode>
where
    F: FnOnce(&ValueArray) -> R,
{
    let xa = get_registry().get(handle_id)?;
    Ok(f(&xa))
}

/// Unregister and drop an array
pub fn unregister_handle(handle_id: HandleId) -> Result<(), ErrorCode> {
    get_registry().unregister(handle_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entry;

    #[test]
    fn test_handle_registry() {
        let registry = HandleRegistry::new();
        assert!(registry.get(0).is_err());
        assert!(registry.unregister(999).is_err());

        let id = registry.register(XArray::new()).unwrap();
        registry.get(id).unwrap().store(3, Some(Entry::Value(9))).unwrap();
        assert_eq!(registry.get(id).unwrap().load(3), Some(Entry::Value(9)));
        assert!(registry.unregister(id).is_ok());
        assert_eq!(registry.get(id).err(), Some(ErrorCode::InvalidHandle));
    }
}
