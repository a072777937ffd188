use crate::types::{InputId, Result, Value};

use super::groups::Groups;
use crate::types::GroupId;

/// Receiver of the fields of one input entity, followed by [`InputEntityVisitor::end_of_entity`].
///
/// Errors returned here are fatal. Per-entity rejections are handled by the
/// visitor itself when the entity ends.
pub trait InputEntityVisitor {
    /// Input id of a node and the id group it lives in.
    fn id(&mut self, _id: &InputId, _group: GroupId) -> Result<()> {
        Ok(())
    }
    /// Node labels.
    fn labels(&mut self, _labels: &[String]) -> Result<()> {
        Ok(())
    }
    /// One property.
    fn property(&mut self, _key: &str, _value: &Value) -> Result<()> {
        Ok(())
    }
    /// Start node of a relationship.
    fn start_id(&mut self, _id: &InputId, _group: GroupId) -> Result<()> {
        Ok(())
    }
    /// End node of a relationship.
    fn end_id(&mut self, _id: &InputId, _group: GroupId) -> Result<()> {
        Ok(())
    }
    /// Relationship type name.
    fn relationship_type(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }
    /// All fields of the entity were visited.
    fn end_of_entity(&mut self) -> Result<()>;
}

/// Node or relationship as read from an input source, before any id resolution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputEntity {
    /// Node input id.
    pub id: Option<InputId>,
    /// Id group of `id`.
    pub group: Option<String>,
    /// Node labels.
    pub labels: Vec<String>,
    /// Properties in input order.
    pub properties: Vec<(String, Value)>,
    /// Relationship start node.
    pub start: Option<InputId>,
    /// Id group of `start`.
    pub start_group: Option<String>,
    /// Relationship end node.
    pub end: Option<InputId>,
    /// Id group of `end`.
    pub end_group: Option<String>,
    /// Relationship type.
    pub relationship_type: Option<String>,
}

impl InputEntity {
    /// Node with an input id.
    pub fn node(id: impl Into<InputId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Node without an input id; it cannot be referenced by relationships.
    pub fn anonymous_node() -> Self {
        Self::default()
    }

    /// Relationship between two input ids.
    pub fn relationship(
        start: impl Into<InputId>,
        relationship_type: impl Into<String>,
        end: impl Into<InputId>,
    ) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            relationship_type: Some(relationship_type.into()),
            ..Self::default()
        }
    }

    /// Relationship without a type, rejected on import.
    pub fn untyped_relationship(start: impl Into<InputId>, end: impl Into<InputId>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            ..Self::default()
        }
    }

    /// Places the node id in `group`.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Resolves the start and end ids in the given groups.
    pub fn between_groups(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.start_group = Some(start.into());
        self.end_group = Some(end.into());
        self
    }

    /// Adds a label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Adds a property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Whether the entity describes a relationship.
    pub fn is_relationship(&self) -> bool {
        self.start.is_some() || self.end.is_some() || self.relationship_type.is_some()
    }

    /// Replays the entity into `visitor`, resolving group names through `groups`.
    pub fn replay(&self, groups: &Groups, visitor: &mut dyn InputEntityVisitor) -> Result<()> {
        if let Some(id) = &self.id {
            visitor.id(id, groups.resolve(self.group.as_deref())?)?;
        }
        if !self.labels.is_empty() {
            visitor.labels(&self.labels)?;
        }
        if let Some(start) = &self.start {
            visitor.start_id(start, groups.resolve(self.start_group.as_deref())?)?;
        }
        if let Some(end) = &self.end {
            visitor.end_id(end, groups.resolve(self.end_group.as_deref())?)?;
        }
        if let Some(name) = &self.relationship_type {
            visitor.relationship_type(name)?;
        }
        for (key, value) in &self.properties {
            visitor.property(key, value)?;
        }
        visitor.end_of_entity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl InputEntityVisitor for Recorder {
        fn id(&mut self, id: &InputId, group: GroupId) -> Result<()> {
            self.events.push(format!("id {id} g{}", group.0));
            Ok(())
        }
        fn labels(&mut self, labels: &[String]) -> Result<()> {
            self.events.push(format!("labels {}", labels.join(",")));
            Ok(())
        }
        fn property(&mut self, key: &str, value: &Value) -> Result<()> {
            self.events.push(format!("{key}={value}"));
            Ok(())
        }
        fn end_of_entity(&mut self) -> Result<()> {
            self.events.push("end".into());
            Ok(())
        }
    }

    #[test]
    fn replay_visits_fields_then_ends() -> Result<()> {
        let groups = Groups::default();
        let entity = InputEntity::node("a")
            .in_group("people")
            .label("Person")
            .property("age", 42i64);
        let mut recorder = Recorder::default();
        entity.replay(&groups, &mut recorder)?;
        assert_eq!(recorder.events, vec!["id a g1", "labels Person", "age=42", "end"]);
        Ok(())
    }
}
