//! Tree edits and the reversible commands they produce.
//!
//! An [`Edit`] is a forward intent ("set LO-3 to developed"). Applying it to
//! a tree yields a [`TreeCommand`] that captures the exact before and after
//! values at that moment. The command can then be replayed in either
//! direction as a new edit, which is how session undo/redo works.

use crate::error::{Result, SdkError};
use crate::tree::{
    self, StatusFields, FIELD_ASSIGNED, FIELD_COURSE_LINK, FIELD_DEADLINE, FIELD_DESCRIPTION,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_db::{AuditAction, Reversible};

/// A forward change to one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Edit {
    /// `developed: None` derives the flag from the status.
    SetStatus {
        target_id: String,
        status: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        developed: Option<Value>,
    },
    /// Insert at `index`, or append when `None`.
    InsertResource {
        target_id: String,
        index: Option<usize>,
        resource: Value,
    },
    RemoveResource { target_id: String, index: usize },
    SetCourseLink { target_id: String, link: Value },
    SetDescription { target_id: String, text: Value },
    SetAssigned { target_id: String, assigned: bool },
    /// `Null` removes the deadline.
    SetDeadline { target_id: String, deadline: Value },
}

impl Edit {
    pub fn target_id(&self) -> &str {
        match self {
            Edit::SetStatus { target_id, .. }
            | Edit::InsertResource { target_id, .. }
            | Edit::RemoveResource { target_id, .. }
            | Edit::SetCourseLink { target_id, .. }
            | Edit::SetDescription { target_id, .. }
            | Edit::SetAssigned { target_id, .. }
            | Edit::SetDeadline { target_id, .. } => target_id,
        }
    }

    /// Apply to `tree` and return the command describing what changed.
    pub fn apply(&self, tree: &mut Value) -> Result<TreeCommand> {
        let target_id = self.target_id().to_string();
        let node = tree::node_fields_mut(tree, &target_id)?;

        let command = match self {
            Edit::SetStatus {
                status, developed, ..
            } => {
                let before = tree::set_status(node, status.clone(), developed.clone());
                let after = StatusFields {
                    status: status.clone(),
                    developed: node.get(tree::FIELD_DEVELOPED).cloned().unwrap_or(Value::Null),
                };
                status_change(target_id, before, after)
            }
            Edit::InsertResource {
                index, resource, ..
            } => {
                let resources = tree::resources_mut(node, &target_id)?;
                let index = index.unwrap_or(resources.len());
                if index > resources.len() {
                    return Err(SdkError::InvalidTree(format!(
                        "{target_id}: resource index {index} out of range"
                    )));
                }
                resources.insert(index, resource.clone());
                TreeCommand::AddResource {
                    target_id,
                    index,
                    resource: resource.clone(),
                }
            }
            Edit::RemoveResource { index, .. } => {
                let resources = tree::resources_mut(node, &target_id)?;
                if *index >= resources.len() {
                    return Err(SdkError::InvalidTree(format!(
                        "{target_id}: resource index {index} out of range"
                    )));
                }
                let resource = resources.remove(*index);
                TreeCommand::RemoveResource {
                    target_id,
                    index: *index,
                    resource,
                }
            }
            Edit::SetCourseLink { link, .. } => {
                let before = tree::set_field(node, FIELD_COURSE_LINK, link.clone());
                TreeCommand::CourseLink {
                    target_id,
                    before,
                    after: link.clone(),
                }
            }
            Edit::SetDescription { text, .. } => {
                let before = tree::set_field(node, FIELD_DESCRIPTION, text.clone());
                TreeCommand::Description {
                    target_id,
                    before,
                    after: text.clone(),
                }
            }
            Edit::SetAssigned { assigned, .. } => {
                let before = tree::set_field(node, FIELD_ASSIGNED, Value::Bool(*assigned));
                TreeCommand::Assignment {
                    target_id,
                    before: before.as_bool().unwrap_or(false),
                    after: *assigned,
                }
            }
            Edit::SetDeadline { deadline, .. } => {
                let before = tree::set_field(node, FIELD_DEADLINE, deadline.clone());
                TreeCommand::Deadline {
                    target_id,
                    before,
                    after: deadline.clone(),
                }
            }
        };
        Ok(command)
    }
}

/// A change that has been applied, with its exact before/after values.
///
/// `Null` stands for "field absent".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeCommand {
    StatusChange {
        target_id: String,
        before: Value,
        after: Value,
        developed_before: Value,
        developed_after: Value,
    },
    AddResource {
        target_id: String,
        index: usize,
        resource: Value,
    },
    RemoveResource {
        target_id: String,
        index: usize,
        resource: Value,
    },
    CourseLink {
        target_id: String,
        before: Value,
        after: Value,
    },
    Description {
        target_id: String,
        before: Value,
        after: Value,
    },
    Assignment {
        target_id: String,
        before: bool,
        after: bool,
    },
    Deadline {
        target_id: String,
        before: Value,
        after: Value,
    },
}

/// Build a status change command from the node's status fields before and
/// after the change.
pub fn status_change(target_id: impl Into<String>, before: StatusFields, after: StatusFields) -> TreeCommand {
    TreeCommand::StatusChange {
        target_id: target_id.into(),
        before: before.status,
        after: after.status,
        developed_before: before.developed,
        developed_after: after.developed,
    }
}

/// Build a resource-add command for a resource inserted at `index`.
pub fn resource_add(target_id: impl Into<String>, index: usize, resource: Value) -> TreeCommand {
    TreeCommand::AddResource {
        target_id: target_id.into(),
        index,
        resource,
    }
}

/// Build a resource-remove command for a resource taken from `index`.
pub fn resource_remove(target_id: impl Into<String>, index: usize, resource: Value) -> TreeCommand {
    TreeCommand::RemoveResource {
        target_id: target_id.into(),
        index,
        resource,
    }
}

/// Build a course-link command.
pub fn course_link(target_id: impl Into<String>, before: Value, after: Value) -> TreeCommand {
    TreeCommand::CourseLink {
        target_id: target_id.into(),
        before,
        after,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "(none)".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl TreeCommand {
    pub fn target_id(&self) -> &str {
        match self {
            TreeCommand::StatusChange { target_id, .. }
            | TreeCommand::AddResource { target_id, .. }
            | TreeCommand::RemoveResource { target_id, .. }
            | TreeCommand::CourseLink { target_id, .. }
            | TreeCommand::Description { target_id, .. }
            | TreeCommand::Assignment { target_id, .. }
            | TreeCommand::Deadline { target_id, .. } => target_id,
        }
    }

    /// Audit action recorded for this change.
    pub fn audit_action(&self) -> AuditAction {
        match self {
            TreeCommand::StatusChange { .. } => AuditAction::StatusChange,
            TreeCommand::AddResource { .. } => AuditAction::ResourceAdd,
            TreeCommand::RemoveResource { .. } => AuditAction::ResourceRemove,
            TreeCommand::CourseLink { .. } => AuditAction::Link,
            TreeCommand::Description { .. } => AuditAction::DescriptionEdit,
            TreeCommand::Assignment { .. } => AuditAction::AssignmentToggle,
            TreeCommand::Deadline { after, .. } if after.is_null() => AuditAction::DeadlineRemove,
            TreeCommand::Deadline { .. } => AuditAction::DeadlineSet,
        }
    }

    /// Whether this change is recorded on the session history.
    pub fn is_undoable(&self) -> bool {
        !matches!(
            self,
            TreeCommand::Assignment { .. } | TreeCommand::Deadline { .. }
        )
    }

    /// Value before the change, if the change has one.
    pub fn old_value(&self) -> Option<Value> {
        match self {
            TreeCommand::StatusChange { before, .. }
            | TreeCommand::CourseLink { before, .. }
            | TreeCommand::Description { before, .. }
            | TreeCommand::Deadline { before, .. } => Some(before.clone()),
            TreeCommand::RemoveResource { resource, .. } => Some(resource.clone()),
            TreeCommand::Assignment { before, .. } => Some(Value::Bool(*before)),
            TreeCommand::AddResource { .. } => None,
        }
    }

    /// Value after the change, if the change has one.
    pub fn new_value(&self) -> Option<Value> {
        match self {
            TreeCommand::StatusChange { after, .. }
            | TreeCommand::CourseLink { after, .. }
            | TreeCommand::Description { after, .. }
            | TreeCommand::Deadline { after, .. } => Some(after.clone()),
            TreeCommand::AddResource { resource, .. } => Some(resource.clone()),
            TreeCommand::Assignment { after, .. } => Some(Value::Bool(*after)),
            TreeCommand::RemoveResource { .. } => None,
        }
    }

    /// Human-readable summary for the audit log and history display.
    pub fn describe(&self) -> String {
        match self {
            TreeCommand::StatusChange {
                target_id,
                before,
                after,
                ..
            } => format!("Status of {target_id}: {} -> {}", display(before), display(after)),
            TreeCommand::AddResource {
                target_id,
                resource,
                ..
            } => format!("Added resource {} to {target_id}", display(resource)),
            TreeCommand::RemoveResource {
                target_id,
                resource,
                ..
            } => format!("Removed resource {} from {target_id}", display(resource)),
            TreeCommand::CourseLink {
                target_id, after, ..
            } => format!("Course link of {target_id} set to {}", display(after)),
            TreeCommand::Description { target_id, .. } => {
                format!("Edited description of {target_id}")
            }
            TreeCommand::Assignment {
                target_id, after, ..
            } => {
                if *after {
                    format!("Assigned {target_id}")
                } else {
                    format!("Unassigned {target_id}")
                }
            }
            TreeCommand::Deadline {
                target_id, after, ..
            } => {
                if after.is_null() {
                    format!("Removed deadline of {target_id}")
                } else {
                    format!("Deadline of {target_id} set to {}", display(after))
                }
            }
        }
    }

    /// The edit that reapplies this change.
    pub fn forward(&self) -> Edit {
        match self.clone() {
            TreeCommand::StatusChange {
                target_id,
                after,
                developed_after,
                ..
            } => Edit::SetStatus {
                target_id,
                status: after,
                developed: Some(developed_after),
            },
            TreeCommand::AddResource {
                target_id,
                index,
                resource,
            } => Edit::InsertResource {
                target_id,
                index: Some(index),
                resource,
            },
            TreeCommand::RemoveResource {
                target_id, index, ..
            } => Edit::RemoveResource { target_id, index },
            TreeCommand::CourseLink {
                target_id, after, ..
            } => Edit::SetCourseLink {
                target_id,
                link: after,
            },
            TreeCommand::Description {
                target_id, after, ..
            } => Edit::SetDescription {
                target_id,
                text: after,
            },
            TreeCommand::Assignment {
                target_id, after, ..
            } => Edit::SetAssigned {
                target_id,
                assigned: after,
            },
            TreeCommand::Deadline {
                target_id, after, ..
            } => Edit::SetDeadline {
                target_id,
                deadline: after,
            },
        }
    }

    /// The edit that reverts this change.
    pub fn inverse(&self) -> Edit {
        match self.clone() {
            TreeCommand::StatusChange {
                target_id,
                before,
                developed_before,
                ..
            } => Edit::SetStatus {
                target_id,
                status: before,
                developed: Some(developed_before),
            },
            TreeCommand::AddResource {
                target_id, index, ..
            } => Edit::RemoveResource { target_id, index },
            TreeCommand::RemoveResource {
                target_id,
                index,
                resource,
            } => Edit::InsertResource {
                target_id,
                index: Some(index),
                resource,
            },
            TreeCommand::CourseLink {
                target_id, before, ..
            } => Edit::SetCourseLink {
                target_id,
                link: before,
            },
            TreeCommand::Description {
                target_id, before, ..
            } => Edit::SetDescription {
                target_id,
                text: before,
            },
            TreeCommand::Assignment {
                target_id, before, ..
            } => Edit::SetAssigned {
                target_id,
                assigned: before,
            },
            TreeCommand::Deadline {
                target_id, before, ..
            } => Edit::SetDeadline {
                target_id,
                deadline: before,
            },
        }
    }
}

/// Something that can commit a tree edit: apply it locally, save it and
/// log it. Implemented by [`Workspace`](crate::Workspace).
#[async_trait]
pub trait TreeTarget: Send + Sync {
    async fn apply_edit(&self, edit: Edit) -> Result<TreeCommand>;
}

#[async_trait]
impl Reversible for TreeCommand {
    type Target = dyn TreeTarget;
    type Error = SdkError;

    async fn undo(&self, target: &Self::Target) -> Result<()> {
        applied(target.apply_edit(self.inverse()).await)
    }

    async fn redo(&self, target: &Self::Target) -> Result<()> {
        applied(target.apply_edit(self.forward()).await)
    }
}

/// A saved but unlogged edit still moved the tree, so the history must move
/// with it. The missing entry has already been reported by the target.
fn applied(result: Result<TreeCommand>) -> Result<()> {
    match result {
        Ok(_) | Err(SdkError::NotLogged { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}
