//! User record restrictions and required-user extraction sources.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::core::UserId;
use crate::permission::PermissionIndex;
use crate::required::RequiredUsers;
use crate::restrict::{ElementFunc, Restricted, RestrictError};

pub const CAN_SEE_NAME: &str = "users.can_see_name";
pub const CAN_SEE_EXTRA: &str = "users.can_see_extra_data";
pub const CAN_MANAGE: &str = "users.can_manage";

const COLLECTION: &str = "users/user";

/// Fields every viewer with `users.can_see_name` may know.
const NAME_FIELDS: &[&str] = &[
    "id",
    "username",
    "title",
    "first_name",
    "last_name",
    "structure_level",
    "number",
    "groups_id",
    "is_present",
];

/// Additional fields for `users.can_see_extra_data`.
const EXTRA_FIELDS: &[&str] = &["gender", "email", "is_active", "is_committee", "comment"];

/// What a viewer learns about a user that is only visible because some
/// visible record requires them.
const REQUIRED_FIELDS: &[&str] = &["id", "title", "first_name", "last_name", "structure_level"];

/// Restriction for `users/user` elements.
pub fn restrict(perms: Arc<PermissionIndex>, required: Arc<RequiredUsers>) -> ElementFunc {
    Box::new(move |uid, element| {
        if perms.is_admin(uid) || perms.has_perm(uid, CAN_MANAGE) {
            return Ok(Restricted::Unchanged);
        }

        #[derive(Deserialize)]
        struct IdOnly {
            id: UserId,
        }
        let target: IdOnly =
            serde_json::from_slice(element).map_err(|source| RestrictError::Decode {
                collection: COLLECTION,
                source,
            })?;

        // A user always sees their own record in full.
        if uid != 0 && uid == target.id {
            return Ok(Restricted::Unchanged);
        }

        if perms.has_perm(uid, CAN_SEE_EXTRA) {
            let keep: Vec<&str> = NAME_FIELDS.iter().chain(EXTRA_FIELDS).copied().collect();
            return whitelist(element, &keep);
        }
        if perms.has_perm(uid, CAN_SEE_NAME) {
            return whitelist(element, NAME_FIELDS);
        }
        if required.is_required(target.id) {
            return whitelist(element, REQUIRED_FIELDS);
        }
        Ok(Restricted::Hidden)
    })
}

fn whitelist(element: &[u8], keep: &[&str]) -> Result<Restricted, RestrictError> {
    let data: serde_json::Map<String, Value> =
        serde_json::from_slice(element).map_err(|source| RestrictError::Decode {
            collection: COLLECTION,
            source,
        })?;
    let kept: serde_json::Map<String, Value> = data
        .into_iter()
        .filter(|(field, _)| keep.contains(&field.as_str()))
        .collect();
    let rewritten = serde_json::to_vec(&kept).map_err(|source| RestrictError::Encode {
        collection: COLLECTION,
        source,
    })?;
    Ok(Restricted::Rewritten(rewritten.into()))
}

/// Speakers of an `agenda/list-of-speakers` element.
pub fn speakers(raw: &[u8]) -> Result<HashSet<UserId>, serde_json::Error> {
    #[derive(Deserialize)]
    struct Speaker {
        user_id: UserId,
    }
    #[derive(Deserialize)]
    struct Element {
        #[serde(default)]
        speakers: Vec<Speaker>,
    }
    let element: Element = serde_json::from_slice(raw)?;
    Ok(element
        .speakers
        .into_iter()
        .map(|speaker| speaker.user_id)
        .collect())
}

/// Submitters and supporters of a `motions/motion` element.
pub fn motion_users(raw: &[u8]) -> Result<HashSet<UserId>, serde_json::Error> {
    #[derive(Deserialize)]
    struct Submitter {
        user_id: UserId,
    }
    #[derive(Deserialize)]
    struct Element {
        #[serde(default)]
        submitters: Vec<Submitter>,
        #[serde(default)]
        supporters_id: Vec<UserId>,
    }
    let element: Element = serde_json::from_slice(raw)?;
    let mut uids: HashSet<UserId> = element
        .submitters
        .into_iter()
        .map(|submitter| submitter.user_id)
        .collect();
    uids.extend(element.supporters_id);
    Ok(uids)
}

/// Candidates of an `assignments/assignment` element.
pub fn candidates(raw: &[u8]) -> Result<HashSet<UserId>, serde_json::Error> {
    #[derive(Deserialize)]
    struct RelatedUser {
        user_id: UserId,
    }
    #[derive(Deserialize)]
    struct Element {
        #[serde(default)]
        assignment_related_users: Vec<RelatedUser>,
    }
    let element: Element = serde_json::from_slice(raw)?;
    Ok(element
        .assignment_related_users
        .into_iter()
        .map(|related| related.user_id)
        .collect())
}
