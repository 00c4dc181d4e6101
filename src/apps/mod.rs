//! Per-collection handlers.
//!
//! Everything collection-specific lives here: restriction rules,
//! required-user extraction, and projector slides. The registries are fixed
//! at startup; the rest of the service dispatches purely by collection name.

pub mod agenda;
pub mod users;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::applause;
use crate::configview::{CONFIG_COLLECTION, ConfigView};
use crate::core::UserId;
use crate::permission::{GROUP_COLLECTION, PermissionIndex, USER_COLLECTION};
use crate::projector::{self, ProjectorElement, SlideContext, SlideError, SlideFn};
use crate::required::{RequiredCallable, RequiredUsers};
use crate::restrict::{ElementFunc, Restricted};

pub const MOTION_COLLECTION: &str = "motions/motion";
pub const SPEAKER_COLLECTION: &str = "agenda/list-of-speakers";
pub const ASSIGNMENT_COLLECTION: &str = "assignments/assignment";

/// Permission gating projector content.
pub const CAN_SEE_PROJECTOR: &str = "core.can_see_projector";
pub const MOTION_CAN_SEE: &str = "motions.can_see";
pub const ASSIGNMENT_CAN_SEE: &str = "assignments.can_see";

/// Shared handles the element functions close over.
#[derive(Clone)]
pub struct AppContext {
    pub perms: Arc<PermissionIndex>,
    pub required: Arc<RequiredUsers>,
    pub config: Arc<ConfigView>,
}

/// The outward-facing restriction registry.
pub fn restricters(context: &AppContext) -> HashMap<&'static str, ElementFunc> {
    let mut registry: HashMap<&'static str, ElementFunc> = HashMap::new();

    registry.insert("agenda/item", agenda::restrict(Arc::clone(&context.perms)));
    registry.insert(
        SPEAKER_COLLECTION,
        needs_perm(Arc::clone(&context.perms), agenda::CAN_SEE_LIST_OF_SPEAKERS),
    );
    registry.insert(
        USER_COLLECTION,
        users::restrict(Arc::clone(&context.perms), Arc::clone(&context.required)),
    );
    registry.insert(GROUP_COLLECTION, public());
    registry.insert(CONFIG_COLLECTION, public());
    registry.insert(
        MOTION_COLLECTION,
        needs_perm(Arc::clone(&context.perms), MOTION_CAN_SEE),
    );
    registry.insert(
        ASSIGNMENT_COLLECTION,
        needs_perm(Arc::clone(&context.perms), ASSIGNMENT_CAN_SEE),
    );
    registry.insert(
        projector::PROJECTOR_COLLECTION,
        needs_perm(Arc::clone(&context.perms), CAN_SEE_PROJECTOR),
    );
    registry.insert(
        projector::SLIDE_COLLECTION,
        needs_perm(Arc::clone(&context.perms), CAN_SEE_PROJECTOR),
    );
    registry.insert(applause::APPLAUSE_SYNTHETIC_COLLECTION, signed_in());

    registry
}

/// Sources feeding the required-users view.
pub fn required_users() -> HashMap<&'static str, RequiredCallable> {
    let mut registry: HashMap<&'static str, RequiredCallable> = HashMap::new();
    registry.insert(
        SPEAKER_COLLECTION,
        RequiredCallable {
            cause: "speaker",
            extract: users::speakers,
        },
    );
    registry.insert(
        MOTION_COLLECTION,
        RequiredCallable {
            cause: "motion",
            extract: users::motion_users,
        },
    );
    registry.insert(
        ASSIGNMENT_COLLECTION,
        RequiredCallable {
            cause: "candidate",
            extract: users::candidates,
        },
    );
    registry
}

/// The projector slide registry.
pub fn slides() -> HashMap<&'static str, SlideFn> {
    let mut registry: HashMap<&'static str, SlideFn> = HashMap::new();
    registry.insert("agenda/item", agenda_item_slide);
    registry.insert(MOTION_COLLECTION, motion_slide);
    registry.insert(USER_COLLECTION, user_slide);
    registry
}

/// Element function passing everything through.
pub fn public() -> ElementFunc {
    Box::new(|_uid, _element| Ok(Restricted::Unchanged))
}

/// Element function requiring a signed-in viewer.
pub fn signed_in() -> ElementFunc {
    Box::new(|uid, _element| {
        if uid == 0 {
            Ok(Restricted::Hidden)
        } else {
            Ok(Restricted::Unchanged)
        }
    })
}

/// Element function gating a whole collection behind one permission.
pub fn needs_perm(perms: Arc<PermissionIndex>, perm: &'static str) -> ElementFunc {
    Box::new(move |uid: UserId, _element: &[u8]| {
        if perms.has_perm(uid, perm) {
            Ok(Restricted::Unchanged)
        } else {
            Ok(Restricted::Hidden)
        }
    })
}

fn agenda_item_slide(
    context: &SlideContext<'_>,
    element: &ProjectorElement,
) -> Result<Value, SlideError> {
    let item = load_model(context, "agenda/item", element)?;
    Ok(json!({
        "title": item.get("title").cloned().unwrap_or(Value::Null),
        "item_number": item.get("item_number").cloned().unwrap_or(Value::Null),
    }))
}

fn motion_slide(
    context: &SlideContext<'_>,
    element: &ProjectorElement,
) -> Result<Value, SlideError> {
    let motion = load_model(context, "motions/motion", element)?;
    Ok(json!({
        "identifier": motion.get("identifier").cloned().unwrap_or(Value::Null),
        "title": motion.get("title").cloned().unwrap_or(Value::Null),
        "text": motion.get("text").cloned().unwrap_or(Value::Null),
    }))
}

fn user_slide(
    context: &SlideContext<'_>,
    element: &ProjectorElement,
) -> Result<Value, SlideError> {
    let user = load_model(context, "users/user", element)?;
    let name = [
        user.get("title"),
        user.get("first_name"),
        user.get("last_name"),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .collect::<Vec<_>>()
    .join(" ");
    Ok(json!({"user": name}))
}

fn load_model(
    context: &SlideContext<'_>,
    collection: &'static str,
    element: &ProjectorElement,
) -> Result<serde_json::Map<String, Value>, SlideError> {
    let id = element.id.ok_or(SlideError::MissingId)?;
    let raw = context
        .get_model(collection, id)
        .ok_or(SlideError::ModelNotFound { collection, id })?;
    serde_json::from_slice(&raw).map_err(|source| SlideError::BadModel {
        collection,
        id,
        source,
    })
}
