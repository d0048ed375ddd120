//! Domain rows for collaborative shopping lists.
//!
//! Rows carry a backend-assigned `updated_at` timestamp (epoch milliseconds)
//! which drives all last-writer-wins conflict decisions. Optimistic local
//! writes stamp a provisional timestamp that the echoed server row replaces.

use serde::{Deserialize, Serialize};

/// A shopping list shared between collaborators.
///
/// Owned by its creator, mutable by any collaborator with access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingList {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    #[serde(default)]
    pub archived: bool,
    /// Monotonic timestamp assigned by the backend (epoch milliseconds).
    pub updated_at: i64,
}

impl ShoppingList {
    pub fn new(id: impl Into<String>, name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            owner_id: owner_id.into(),
            archived: false,
            updated_at: 0,
        }
    }

    /// Field equality ignoring `updated_at`.
    ///
    /// An echoed write differs from its optimistic original only in the
    /// timestamp; content-equal rows must not surface as a second visible
    /// mutation to observers.
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.owner_id == other.owner_id
            && self.archived == other.archived
    }
}

/// A single item belonging to exactly one shopping list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: String,
    pub list_id: String,
    pub name: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub checked: bool,
    /// Monotonic timestamp assigned by the backend (epoch milliseconds).
    pub updated_at: i64,
}

fn default_quantity() -> u32 {
    1
}

impl ListItem {
    pub fn new(id: impl Into<String>, list_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            list_id: list_id.into(),
            name: name.into(),
            quantity: 1,
            checked: false,
            updated_at: 0,
        }
    }

    /// Field equality ignoring `updated_at`.
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.list_id == other.list_id
            && self.name == other.name
            && self.quantity == other.quantity
            && self.checked == other.checked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_roundtrip() {
        let list = ShoppingList {
            id: "L1".into(),
            name: "Groceries".into(),
            owner_id: "alice".into(),
            archived: false,
            updated_at: 100,
        };
        let json = serde_json::to_value(&list).unwrap();
        let back: ShoppingList = serde_json::from_value(json).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn test_item_defaults() {
        // Backend rows may omit optional columns
        let json = serde_json::json!({
            "id": "I1",
            "list_id": "L1",
            "name": "Milk",
            "updated_at": 5
        });
        let item: ListItem = serde_json::from_value(json).unwrap();
        assert_eq!(item.quantity, 1);
        assert!(!item.checked);
    }

    #[test]
    fn test_same_content_ignores_timestamp() {
        let a = ListItem::new("I1", "L1", "Milk");
        let mut b = a.clone();
        b.updated_at = 999;
        assert!(a.same_content(&b));
        assert_ne!(a, b);

        b.checked = true;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_list_same_content() {
        let a = ShoppingList::new("L1", "Groceries", "alice");
        let mut b = a.clone();
        b.updated_at = 50;
        assert!(a.same_content(&b));

        b.archived = true;
        assert!(!a.same_content(&b));
    }
}
