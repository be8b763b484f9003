/// Shopping-list operations
/// Operations are the mutations clients request; deltas are what the list actually committed
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{ClientId, LamportClock, ListId, Result, SyncError, UserId, Version};

uuid_id!(
    /// Unique operation identifier
    OperationId
);

uuid_id!(
    /// Item identifier, unique within a list and never reused
    ItemId
);

/// Last-writer-wins key: logical timestamp first, client id breaks ties
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: LamportClock,
    pub client: ClientId,
}

impl Stamp {
    pub fn new(clock: LamportClock, client: ClientId) -> Self {
        Self { clock, client }
    }
}

/// Scalar fields of an item, each merged independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Quantity,
    Unit,
    Category,
    Price,
    Checked,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Name,
        Field::Quantity,
        Field::Unit,
        Field::Category,
        Field::Price,
        Field::Checked,
    ];
}

/// New value for a single field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldChange {
    Name(String),
    Quantity(u32),
    Unit(Option<String>),
    Category(Option<String>),
    Price(Option<u64>),
    Checked(bool),
}

impl FieldChange {
    pub fn field(&self) -> Field {
        match self {
            FieldChange::Name(_) => Field::Name,
            FieldChange::Quantity(_) => Field::Quantity,
            FieldChange::Unit(_) => Field::Unit,
            FieldChange::Category(_) => Field::Category,
            FieldChange::Price(_) => Field::Price,
            FieldChange::Checked(_) => Field::Checked,
        }
    }
}

/// Per-field stamps of the write that produced each current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStamps {
    pub name: Stamp,
    pub quantity: Stamp,
    pub unit: Stamp,
    pub category: Stamp,
    pub price: Stamp,
    pub checked: Stamp,
}

impl FieldStamps {
    pub fn uniform(stamp: Stamp) -> Self {
        Self {
            name: stamp,
            quantity: stamp,
            unit: stamp,
            category: stamp,
            price: stamp,
            checked: stamp,
        }
    }

    pub fn get(&self, field: Field) -> Stamp {
        match field {
            Field::Name => self.name,
            Field::Quantity => self.quantity,
            Field::Unit => self.unit,
            Field::Category => self.category,
            Field::Price => self.price,
            Field::Checked => self.checked,
        }
    }

    fn set(&mut self, field: Field, stamp: Stamp) {
        let slot = match field {
            Field::Name => &mut self.name,
            Field::Quantity => &mut self.quantity,
            Field::Unit => &mut self.unit,
            Field::Category => &mut self.category,
            Field::Price => &mut self.price,
            Field::Checked => &mut self.checked,
        };
        *slot = stamp;
    }
}

/// Payload of an Add: the item as the client created it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub id: ItemId,
    pub name: String,
    pub quantity: u32,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price_cents: Option<u64>,
    #[serde(default)]
    pub checked: bool,
}

impl ItemDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ItemId::new(),
            name: name.into(),
            quantity: 1,
            unit: None,
            category: None,
            price_cents: None,
            checked: false,
        }
    }

    pub fn with_id(mut self, id: ItemId) -> Self {
        self.id = id;
        self
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_price_cents(mut self, price_cents: u64) -> Self {
        self.price_cents = Some(price_cents);
        self
    }

    fn field_changes(&self) -> Vec<FieldChange> {
        vec![
            FieldChange::Name(self.name.clone()),
            FieldChange::Quantity(self.quantity),
            FieldChange::Unit(self.unit.clone()),
            FieldChange::Category(self.category.clone()),
            FieldChange::Price(self.price_cents),
            FieldChange::Checked(self.checked),
        ]
    }
}

/// A live shopping-list item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    pub quantity: u32,
    pub unit: Option<String>,
    pub category: Option<String>,
    pub price_cents: Option<u64>,
    pub checked: bool,

    /// Author of the newest write to any field
    pub last_modified_by: UserId,

    /// Stamp of the Add that created the item; orders the list
    pub created: Stamp,

    /// Newest stamp over all fields
    pub modified: Stamp,

    pub stamps: FieldStamps,
}

impl Item {
    pub fn from_draft(draft: &ItemDraft, author: UserId, stamp: Stamp) -> Self {
        Self {
            id: draft.id,
            name: draft.name.clone(),
            quantity: draft.quantity,
            unit: draft.unit.clone(),
            category: draft.category.clone(),
            price_cents: draft.price_cents,
            checked: draft.checked,
            last_modified_by: author,
            created: stamp,
            modified: stamp,
            stamps: FieldStamps::uniform(stamp),
        }
    }

    /// Whether a write stamped `stamp` would win the field
    pub fn accepts(&self, field: Field, stamp: Stamp) -> bool {
        stamp > self.stamps.get(field)
    }

    /// Write one field if `stamp` beats the field's current stamp
    pub fn write(&mut self, change: &FieldChange, stamp: Stamp, author: UserId) -> bool {
        let field = change.field();
        if !self.accepts(field, stamp) {
            return false;
        }

        match change {
            FieldChange::Name(name) => self.name = name.clone(),
            FieldChange::Quantity(quantity) => self.quantity = *quantity,
            FieldChange::Unit(unit) => self.unit = unit.clone(),
            FieldChange::Category(category) => self.category = category.clone(),
            FieldChange::Price(price) => self.price_cents = *price,
            FieldChange::Checked(checked) => self.checked = *checked,
        }
        self.stamps.set(field, stamp);

        if stamp > self.modified {
            self.modified = stamp;
            self.last_modified_by = author;
        }
        true
    }
}

/// A mutation requested by a client; immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub list_id: ListId,

    /// Client that issued the operation
    pub client_id: ClientId,

    /// Client-local sequence number
    pub seq: u64,

    /// List version the client had seen when issuing the operation
    pub base_version: Version,

    /// Client Lamport clock at issue time
    pub clock: LamportClock,

    pub kind: OperationKind,
}

impl Operation {
    pub fn new(
        list_id: ListId,
        client_id: ClientId,
        seq: u64,
        base_version: Version,
        clock: LamportClock,
        kind: OperationKind,
    ) -> Self {
        Self {
            id: OperationId::new(),
            list_id,
            client_id,
            seq,
            base_version,
            clock,
            kind,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.clock, self.client_id)
    }

    pub fn target(&self) -> ItemId {
        self.kind.target()
    }

    /// Reject operations that are malformed regardless of list state
    pub fn validate(&self) -> Result<()> {
        let changes = match &self.kind {
            OperationKind::Add { item } => item.field_changes(),
            OperationKind::Update { changes, .. } => {
                if changes.is_empty() {
                    return Err(SyncError::InvalidOperation(
                        "update carries no field changes".to_string(),
                    ));
                }
                changes.clone()
            }
            OperationKind::Delete { .. } | OperationKind::Check { .. } => return Ok(()),
        };

        let mut seen = BTreeSet::new();
        for change in &changes {
            if !seen.insert(change.field()) {
                return Err(SyncError::InvalidOperation(format!(
                    "field {:?} changed twice",
                    change.field()
                )));
            }
            if let FieldChange::Name(name) = change {
                if name.trim().is_empty() {
                    return Err(SyncError::InvalidOperation(
                        "item name must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Kinds of mutation a client can request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Add {
        item: ItemDraft,
    },
    Update {
        item_id: ItemId,
        changes: Vec<FieldChange>,
    },
    Delete {
        item_id: ItemId,
    },
    Check {
        item_id: ItemId,
        checked: bool,
    },
}

impl OperationKind {
    pub fn target(&self) -> ItemId {
        match self {
            OperationKind::Add { item } => item.id,
            OperationKind::Update { item_id, .. }
            | OperationKind::Delete { item_id }
            | OperationKind::Check { item_id, .. } => *item_id,
        }
    }

    /// Field writes this operation requests
    pub fn changes(&self) -> Vec<FieldChange> {
        match self {
            OperationKind::Add { item } => item.field_changes(),
            OperationKind::Update { changes, .. } => changes.clone(),
            OperationKind::Check { checked, .. } => vec![FieldChange::Checked(*checked)],
            OperationKind::Delete { .. } => Vec::new(),
        }
    }
}

/// The effective change a committed operation made
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delta {
    Added {
        item: Item,
    },
    /// `changes` holds only the fields that won; it may be empty
    Updated {
        item_id: ItemId,
        changes: Vec<FieldChange>,
        stamp: Stamp,
        author: UserId,
    },
    Deleted {
        item_id: ItemId,
        stamp: Stamp,
        author: UserId,
    },
}

impl Delta {
    pub fn target(&self) -> ItemId {
        match self {
            Delta::Added { item } => item.id,
            Delta::Updated { item_id, .. } | Delta::Deleted { item_id, .. } => *item_id,
        }
    }

    pub fn stamp(&self) -> Stamp {
        match self {
            Delta::Added { item } => item.created,
            Delta::Updated { stamp, .. } | Delta::Deleted { stamp, .. } => *stamp,
        }
    }

    pub fn author(&self) -> UserId {
        match self {
            Delta::Added { item } => item.last_modified_by,
            Delta::Updated { author, .. } | Delta::Deleted { author, .. } => *author,
        }
    }

    /// Fields whose value this delta wrote
    pub fn fields(&self) -> Vec<Field> {
        match self {
            Delta::Added { .. } => Field::ALL.to_vec(),
            Delta::Updated { changes, .. } => changes.iter().map(FieldChange::field).collect(),
            Delta::Deleted { .. } => Vec::new(),
        }
    }
}
