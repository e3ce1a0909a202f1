use crate::arena::Arena;
use crate::error::{Error, Result};

/// Grow `arena` after it failed to provide a block of `requested` bytes.
///
/// The arena at least doubles, or grows by twice the request if that is more. Close to the
/// maximum size it takes whatever is left, as long as the request still fits. Must be called with
/// the global lock held exclusively.
pub(crate) fn grow_for(arena: &mut Arena, requested: u64) -> Result<u64> {
    let current = arena.size();
    let max = arena.max_size();
    let wanted = current.max(requested).saturating_mul(2);
    let headroom = max.saturating_sub(current);

    let extra = if wanted <= headroom {
        wanted
    } else if requested <= headroom {
        headroom
    } else {
        return Err(Error::Capacity {
            requested: current.saturating_add(requested),
            max,
        });
    };

    arena.grow(extra)
}
