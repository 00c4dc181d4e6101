//! Agenda restrictions.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::permission::PermissionIndex;
use crate::restrict::{ElementFunc, Restricted, RestrictError};

pub const CAN_SEE: &str = "agenda.can_see";
pub const CAN_MANAGE: &str = "agenda.can_manage";
pub const CAN_SEE_INTERNAL: &str = "agenda.can_see_internal_items";

/// Permission needed for the list-of-speakers elements.
pub const CAN_SEE_LIST_OF_SPEAKERS: &str = "agenda.can_see_list_of_speakers";

const COLLECTION: &str = "agenda/item";

/// Restriction for `agenda/item` elements.
///
/// Hidden items need manage, internal items need see-internal; without both,
/// the `comment` and `duration` fields are stripped down to what the viewer
/// may know.
pub fn restrict(perms: Arc<PermissionIndex>) -> ElementFunc {
    Box::new(move |uid, element| {
        if !perms.has_perm(uid, CAN_SEE) {
            return Ok(Restricted::Hidden);
        }

        #[derive(Deserialize)]
        struct ItemFlags {
            #[serde(default)]
            is_hidden: bool,
            #[serde(default)]
            is_internal: bool,
        }

        let flags: ItemFlags =
            serde_json::from_slice(element).map_err(|source| RestrictError::Decode {
                collection: COLLECTION,
                source,
            })?;

        let can_manage = perms.has_perm(uid, CAN_MANAGE);
        let can_see_internal = perms.has_perm(uid, CAN_SEE_INTERNAL);

        if !can_manage && flags.is_hidden {
            return Ok(Restricted::Hidden);
        }
        if !can_see_internal && flags.is_internal {
            return Ok(Restricted::Hidden);
        }
        if can_manage && can_see_internal {
            return Ok(Restricted::Unchanged);
        }

        let mut data: serde_json::Map<String, Value> =
            serde_json::from_slice(element).map_err(|source| RestrictError::Decode {
                collection: COLLECTION,
                source,
            })?;

        if !can_see_internal {
            data.remove("duration");
        }
        if !can_manage {
            data.remove("comment");
        }

        let rewritten =
            serde_json::to_vec(&data).map_err(|source| RestrictError::Encode {
                collection: COLLECTION,
                source,
            })?;
        Ok(Restricted::Rewritten(rewritten.into()))
    })
}
