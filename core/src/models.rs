use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::category::Category;
use crate::conflict::ConflictRecord;
use crate::error::{Error, Result};

/// Every syncable record kind. Watermarks, deltas and conflict policies are all
/// keyed on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Recipe,
    PantryItem,
    ShoppingList,
    ShoppingItem,
    MealPlan,
    MealPlanEntry,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Recipe,
        EntityType::PantryItem,
        EntityType::ShoppingList,
        EntityType::ShoppingItem,
        EntityType::MealPlan,
        EntityType::MealPlanEntry,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Recipe => "recipe",
            EntityType::PantryItem => "pantry_item",
            EntityType::ShoppingList => "shopping_list",
            EntityType::ShoppingItem => "shopping_item",
            EntityType::MealPlan => "meal_plan",
            EntityType::MealPlanEntry => "meal_plan_entry",
        }
    }

    /// Backing table, which doubles as the plural name used on the wire.
    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            EntityType::Recipe => "recipes",
            EntityType::PantryItem => "pantry_items",
            EntityType::ShoppingList => "shopping_lists",
            EntityType::ShoppingItem => "shopping_items",
            EntityType::MealPlan => "meal_plans",
            EntityType::MealPlanEntry => "meal_plan_entries",
        }
    }

    /// Accepts singular or plural names, with `-` or `_` separators.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized || e.table() == normalized)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn first_version() -> i64 {
    1
}

/// Version, modification stamp and tombstone shared by every syncable row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    #[serde(default = "first_version")]
    pub sync_version: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SyncMeta {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A record that participates in delta sync and conflict resolution.
pub trait Versioned {
    const ENTITY: EntityType;

    fn id(&self) -> &str;
    fn owner_id(&self) -> &str;
    fn sync(&self) -> &SyncMeta;
}

macro_rules! versioned {
    ($ty:ty, $entity:expr) => {
        impl Versioned for $ty {
            const ENTITY: EntityType = $entity;

            fn id(&self) -> &str {
                &self.id
            }

            fn owner_id(&self) -> &str {
                &self.owner_id
            }

            fn sync(&self) -> &SyncMeta {
                &self.sync
            }
        }
    };
}

// --- Entities ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub instruction: String,
    #[serde(default)]
    pub timer_minutes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    #[serde(default)]
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub servings: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub sync: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PantryItem {
    pub id: String,
    #[serde(default)]
    pub owner_id: String,
    pub name: String,
    pub category: Category,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub sync: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingList {
    pub id: String,
    #[serde(default)]
    pub owner_id: String,
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub sync: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingItem {
    pub id: String,
    pub list_id: String,
    #[serde(default)]
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    /// Free text as entered; normalized only when merged into the pantry.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub checked: bool,
    /// Name of the recipe this item was imported from.
    #[serde(default)]
    pub recipe_tag: Option<String>,
    #[serde(default)]
    pub position: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub sync: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlan {
    pub id: String,
    #[serde(default)]
    pub owner_id: String,
    pub week_start: NaiveDate,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub sync: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlanEntry {
    pub id: String,
    pub plan_id: String,
    #[serde(default)]
    pub owner_id: String,
    pub recipe_id: String,
    pub day: i64,
    pub meal_type: String,
    #[serde(default)]
    pub servings: Option<f64>,
    #[serde(default)]
    pub position: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub sync: SyncMeta,
}

versioned!(Recipe, EntityType::Recipe);
versioned!(PantryItem, EntityType::PantryItem);
versioned!(ShoppingList, EntityType::ShoppingList);
versioned!(ShoppingItem, EntityType::ShoppingItem);
versioned!(MealPlan, EntityType::MealPlan);
versioned!(MealPlanEntry, EntityType::MealPlanEntry);

// --- Inputs ---

/// Distinguishes "field absent" (`None`) from "field set to null"
/// (`Some(None)`) in partial updates.
pub fn deserialize_some<'de, T, D>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRecipe {
    /// Clients may mint ids offline.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub servings: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRecipe {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub servings: Option<Option<f64>>,
    pub tags: Option<Vec<String>>,
    pub is_public: Option<bool>,
    pub ingredients: Option<Vec<Ingredient>>,
    pub steps: Option<Vec<Step>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPantryItem {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePantryItem {
    pub name: Option<String>,
    pub category: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub quantity: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub unit: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewShoppingList {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewShoppingItem {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub checked: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateShoppingItem {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub quantity: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub unit: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub category: Option<Option<String>>,
    pub checked: Option<bool>,
    pub position: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMealPlanEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub recipe_id: String,
    pub day: i64,
    pub meal_type: String,
    #[serde(default)]
    pub servings: Option<f64>,
}

// --- Sync payloads ---

/// One row of a delta, tagged with its tombstone flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change<T> {
    pub deleted: bool,
    #[serde(flatten)]
    pub record: T,
}

impl<T: Versioned> Change<T> {
    pub fn new(record: T) -> Self {
        Self {
            deleted: record.sync().is_tombstone(),
            record,
        }
    }
}

/// Rows of one entity type changed after a watermark, in `updated_at` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch<T> {
    pub rows: Vec<Change<T>>,
    /// Highest `updated_at` in `rows`, or the requested watermark when empty.
    pub watermark: Option<DateTime<Utc>>,
}

impl<T: Versioned> DeltaBatch<T> {
    #[must_use]
    pub fn from_rows(rows: Vec<T>, since: Option<DateTime<Utc>>) -> Self {
        let watermark = rows
            .iter()
            .map(|r| r.sync().updated_at)
            .max()
            .or(since);
        Self {
            rows: rows.into_iter().map(Change::new).collect(),
            watermark,
        }
    }
}

impl<T> DeltaBatch<T> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Last-seen `updated_at` per entity type. Missing means "everything".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Watermarks {
    pub recipes: Option<DateTime<Utc>>,
    pub pantry_items: Option<DateTime<Utc>>,
    pub shopping_lists: Option<DateTime<Utc>>,
    pub shopping_items: Option<DateTime<Utc>>,
    pub meal_plans: Option<DateTime<Utc>>,
    pub meal_plan_entries: Option<DateTime<Utc>>,
}

impl Watermarks {
    #[must_use]
    pub fn get(&self, entity: EntityType) -> Option<DateTime<Utc>> {
        match entity {
            EntityType::Recipe => self.recipes,
            EntityType::PantryItem => self.pantry_items,
            EntityType::ShoppingList => self.shopping_lists,
            EntityType::ShoppingItem => self.shopping_items,
            EntityType::MealPlan => self.meal_plans,
            EntityType::MealPlanEntry => self.meal_plan_entries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub recipes: DeltaBatch<Recipe>,
    pub pantry_items: DeltaBatch<PantryItem>,
    pub shopping_lists: DeltaBatch<ShoppingList>,
    pub shopping_items: DeltaBatch<ShoppingItem>,
    pub meal_plans: DeltaBatch<MealPlan>,
    pub meal_plan_entries: DeltaBatch<MealPlanEntry>,
    pub server_timestamp: DateTime<Utc>,
}

impl SyncPayload {
    /// Watermarks a client should store after applying this payload.
    #[must_use]
    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            recipes: self.recipes.watermark,
            pantry_items: self.pantry_items.watermark,
            shopping_lists: self.shopping_lists.watermark,
            shopping_items: self.shopping_items.watermark,
            meal_plans: self.meal_plans.watermark,
            meal_plan_entries: self.meal_plan_entries.watermark,
        }
    }
}

/// Delta for a single entity type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityChanges {
    Recipes(DeltaBatch<Recipe>),
    PantryItems(DeltaBatch<PantryItem>),
    ShoppingLists(DeltaBatch<ShoppingList>),
    ShoppingItems(DeltaBatch<ShoppingItem>),
    MealPlans(DeltaBatch<MealPlan>),
    MealPlanEntries(DeltaBatch<MealPlanEntry>),
}

impl EntityChanges {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            EntityChanges::Recipes(b) => b.rows.len(),
            EntityChanges::PantryItems(b) => b.rows.len(),
            EntityChanges::ShoppingLists(b) => b.rows.len(),
            EntityChanges::ShoppingItems(b) => b.rows.len(),
            EntityChanges::MealPlans(b) => b.rows.len(),
            EntityChanges::MealPlanEntries(b) => b.rows.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client copies pushed back to the server. Each copy's `sync_version` is the
/// version the client last saw and its `updated_at` the local edit time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncPush {
    pub since: Watermarks,
    pub recipes: Vec<Recipe>,
    pub pantry_items: Vec<PantryItem>,
    pub shopping_lists: Vec<ShoppingList>,
    pub shopping_items: Vec<ShoppingItem>,
    pub meal_plans: Vec<MealPlan>,
    pub meal_plan_entries: Vec<MealPlanEntry>,
}

impl SyncPush {
    #[must_use]
    pub fn len(&self) -> usize {
        self.recipes.len()
            + self.pantry_items.len()
            + self.shopping_lists.len()
            + self.shopping_items.len()
            + self.meal_plans.len()
            + self.meal_plan_entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A pushed id the server folded into the row that already held its natural
/// key. Clients replace `client_id` with `server_id` locally; pushing
/// `client_id` again is a no-op that reports the same remap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRemap {
    pub resource_type: EntityType,
    pub client_id: String,
    pub server_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushOutcome {
    /// Copies that changed server state: inserts, fast-forwards, client wins
    /// and folds that credited the surviving row.
    pub applied: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub merged: Vec<IdRemap>,
    pub delta: SyncPayload,
}

/// Result of converting a shopping list's checked items into pantry stock.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionSummary {
    pub list: ShoppingList,
    /// Pantry rows touched by the merge, one per merge key.
    pub pantry: Vec<PantryItem>,
    pub retired_item_ids: Vec<String>,
}

// --- Validation ---

pub const MEAL_TYPES: &[&str] = &["breakfast", "lunch", "dinner", "snack"];

/// Absent quantities are the additive identity; the sum is absent only when
/// both sides are.
#[must_use]
pub fn add_quantities(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
    }
}

pub fn validate_meal_type(meal: &str) -> Result<String> {
    let lower = meal.trim().to_lowercase();
    if MEAL_TYPES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        Err(Error::invalid(format!(
            "invalid meal type '{meal}', must be one of: {}",
            MEAL_TYPES.join(", ")
        )))
    }
}

/// Trimmed, non-empty name.
pub fn validate_name(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

pub fn validate_quantity(field: &str, value: Option<f64>) -> Result<Option<f64>> {
    match value {
        Some(q) if !q.is_finite() || q < 0.0 => Err(Error::invalid(format!(
            "{field} must be a non-negative number"
        ))),
        other => Ok(other),
    }
}

pub fn validate_day(day: i64) -> Result<i64> {
    if (0..=6).contains(&day) {
        Ok(day)
    } else {
        Err(Error::invalid(format!("day must be between 0 and 6, got {day}")))
    }
}

/// Meal plans are keyed by the Monday that starts the week.
pub fn validate_week_start(week_start: NaiveDate) -> Result<NaiveDate> {
    if week_start.weekday() == Weekday::Mon {
        Ok(week_start)
    } else {
        Err(Error::invalid(format!(
            "week_start must be a Monday, {week_start} is a {}",
            week_start.weekday()
        )))
    }
}

/// Parse `YYYY-MM-DD` and check it starts a week.
pub fn parse_week_start(raw: &str) -> Result<NaiveDate> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| Error::invalid(format!("invalid date '{raw}', expected YYYY-MM-DD")))?;
    validate_week_start(date)
}

/// Client-minted ids must be UUIDs; a missing id gets a fresh v4.
pub fn resolve_id(id: Option<&str>) -> Result<String> {
    match id {
        None => Ok(Uuid::new_v4().to_string()),
        Some(raw) => validate_id(raw),
    }
}

pub fn validate_id(raw: &str) -> Result<String> {
    Uuid::parse_str(raw.trim())
        .map(|u| u.to_string())
        .map_err(|_| Error::invalid(format!("invalid id '{raw}', expected a UUID")))
}

pub fn validate_ingredients(ingredients: &[Ingredient]) -> Result<()> {
    for ingredient in ingredients {
        validate_name("ingredient name", &ingredient.name)?;
        validate_quantity("ingredient quantity", ingredient.quantity)?;
    }
    Ok(())
}

pub fn validate_steps(steps: &[Step]) -> Result<()> {
    for step in steps {
        validate_name("step instruction", &step.instruction)?;
        if step.timer_minutes.is_some_and(|m| m < 0) {
            return Err(Error::invalid("step timer must not be negative"));
        }
    }
    Ok(())
}

pub fn validate_servings(servings: Option<f64>) -> Result<Option<f64>> {
    match servings {
        Some(s) if !s.is_finite() || s <= 0.0 => {
            Err(Error::invalid("servings must be a positive number"))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_quantities_absent_is_identity() {
        assert_eq!(add_quantities(None, None), None);
        assert_eq!(add_quantities(Some(3.0), None), Some(3.0));
        assert_eq!(add_quantities(None, Some(2.0)), Some(2.0));
        assert_eq!(add_quantities(Some(3.0), Some(2.0)), Some(5.0));
    }

    #[test]
    fn test_valid_meal_types() {
        for meal in MEAL_TYPES {
            assert_eq!(validate_meal_type(meal).unwrap(), *meal);
        }
        assert_eq!(validate_meal_type(" Dinner ").unwrap(), "dinner");
    }

    #[test]
    fn test_invalid_meal_type() {
        let err = validate_meal_type("brunch").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_validate_name_trims() {
        assert_eq!(validate_name("name", "  Milk ").unwrap(), "Milk");
        assert!(validate_name("name", "   ").is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert_eq!(validate_quantity("q", None).unwrap(), None);
        assert_eq!(validate_quantity("q", Some(0.0)).unwrap(), Some(0.0));
        assert!(validate_quantity("q", Some(-1.0)).is_err());
        assert!(validate_quantity("q", Some(f64::NAN)).is_err());
    }

    #[test]
    fn test_week_start_must_be_monday() {
        assert!(parse_week_start("2024-01-01").is_ok());
        assert!(parse_week_start("2024-01-02").is_err());
        assert!(parse_week_start("not-a-date").is_err());
    }

    #[test]
    fn test_validate_day() {
        assert!(validate_day(0).is_ok());
        assert!(validate_day(6).is_ok());
        assert!(validate_day(7).is_err());
        assert!(validate_day(-1).is_err());
    }

    #[test]
    fn test_resolve_id() {
        let minted = resolve_id(None).unwrap();
        assert!(Uuid::parse_str(&minted).is_ok());
        let given = "6f1c2d3e-4b5a-4c6d-8e7f-9a0b1c2d3e4f";
        assert_eq!(resolve_id(Some(given)).unwrap(), given);
        assert!(resolve_id(Some("nope")).is_err());
    }

    #[test]
    fn test_entity_type_parse() {
        assert_eq!(EntityType::parse("recipes"), Some(EntityType::Recipe));
        assert_eq!(EntityType::parse("pantry-items"), Some(EntityType::PantryItem));
        assert_eq!(
            EntityType::parse("meal_plan_entry"),
            Some(EntityType::MealPlanEntry)
        );
        assert_eq!(EntityType::parse("foods"), None);
    }

    #[test]
    fn test_update_distinguishes_null_from_absent() {
        let update: UpdatePantryItem = serde_json::from_str(r#"{"quantity": null}"#).unwrap();
        assert_eq!(update.quantity, Some(None));
        assert_eq!(update.unit, None);

        let update: UpdatePantryItem = serde_json::from_str(r#"{"unit": "kg"}"#).unwrap();
        assert_eq!(update.unit, Some(Some("kg".to_string())));
        assert_eq!(update.quantity, None);
    }

    #[test]
    fn test_change_carries_tombstone_flag() {
        let list = ShoppingList {
            id: "l1".into(),
            owner_id: "alice".into(),
            name: "Weekly".into(),
            created_at: Utc::now(),
            sync: SyncMeta {
                sync_version: 2,
                updated_at: Utc::now(),
                deleted_at: Some(Utc::now()),
            },
        };
        let json = serde_json::to_value(Change::new(list)).unwrap();
        assert_eq!(json["deleted"], true);
        assert_eq!(json["sync_version"], 2);
        assert_eq!(json["name"], "Weekly");
    }

    #[test]
    fn test_pushed_copy_defaults() {
        let item: PantryItem = serde_json::from_str(
            r#"{"id": "p1", "name": "Rice", "category": "pantry",
                "updated_at": "2024-01-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(item.sync.sync_version, 1);
        assert!(!item.sync.is_tombstone());
        assert_eq!(item.quantity, None);
    }

    #[test]
    fn test_empty_batch_keeps_requested_watermark() {
        let since = Utc::now();
        let batch: DeltaBatch<ShoppingList> = DeltaBatch::from_rows(Vec::new(), Some(since));
        assert!(batch.is_empty());
        assert_eq!(batch.watermark, Some(since));
    }
}
