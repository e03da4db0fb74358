//! View definitions and per-database profiling settings.

use std::sync::Arc;

use imbl::{HashMap, HashSet, OrdMap};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::types::{CatalogError, DatabaseName, Namespace, Result};

/// A named, stored aggregation over another namespace of the same database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// Namespace of the view itself.
    pub name: Namespace,
    /// Namespace the pipeline reads from.
    pub view_on: Namespace,
    /// Pipeline stages, each a single-key document such as `{"$match": {..}}`.
    pub pipeline: Vec<Value>,
    /// Optional collation document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<Value>,
}

impl ViewDefinition {
    /// Parses a durable `system.views` record
    /// (`{"_id": "db.view", "viewOn": "coll", "pipeline": [..]}`).
    pub fn from_record(record: &Value) -> Result<Self> {
        let invalid = |msg: String| CatalogError::InvalidViewDefinition(msg);
        let obj = record
            .as_object()
            .ok_or_else(|| invalid(format!("view record is not a document: {record}")))?;
        let id = obj
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("view record has no string _id".into()))?;
        let name = Namespace::parse(id)?;
        let view_on = obj
            .get("viewOn")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(format!("view {name} has no viewOn")))?;
        let view_on = Namespace::new(name.db().as_str(), view_on)?;
        let pipeline = match obj.get("pipeline") {
            Some(Value::Array(stages)) => stages.clone(),
            Some(_) => {
                return Err(CatalogError::InvalidPipeline(format!(
                    "pipeline of view {name} is not an array"
                )))
            }
            None => Vec::new(),
        };
        Ok(Self {
            name,
            view_on,
            pipeline,
            collation: obj.get("collation").cloned(),
        })
    }

    /// Renders the durable record form.
    pub fn to_record(&self) -> Value {
        let mut record = json!({
            "_id": self.name.to_string(),
            "viewOn": self.view_on.coll(),
            "pipeline": self.pipeline,
        });
        if let (Some(collation), Some(obj)) = (&self.collation, record.as_object_mut()) {
            obj.insert("collation".into(), collation.clone());
        }
        record
    }
}

/// Whether a new view already has a durable record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    /// The record was written by the caller.
    Durable,
    /// The catalog must write the record on commit.
    NotYetDurable,
}

/// Validation hook run on every view definition before it is accepted.
pub type ViewValidator = Arc<dyn Fn(&ViewDefinition) -> Result<()> + Send + Sync>;

/// Checks that every stage is a single-key document whose key starts with `$`.
pub fn validate_pipeline(pipeline: &[Value]) -> Result<()> {
    for (pos, stage) in pipeline.iter().enumerate() {
        let Some(obj) = stage.as_object() else {
            return Err(CatalogError::InvalidPipeline(format!(
                "stage {pos} is not a document"
            )));
        };
        let mut keys = obj.keys();
        match (keys.next(), keys.next()) {
            (Some(name), None) if name.starts_with('$') => {}
            (Some(name), None) => {
                return Err(CatalogError::InvalidPipeline(format!(
                    "stage {pos} name {name:?} must start with '$'"
                )))
            }
            _ => {
                return Err(CatalogError::InvalidPipeline(format!(
                    "stage {pos} must have exactly one field"
                )))
            }
        }
    }
    Ok(())
}

/// Default view validation: same database, not self-referential, well-formed
/// pipeline and collation.
pub fn default_view_validator(view: &ViewDefinition) -> Result<()> {
    if view.name.db() != view.view_on.db() {
        return Err(CatalogError::InvalidViewDefinition(format!(
            "view {} must be in the same database as {}",
            view.name, view.view_on
        )));
    }
    if view.name == view.view_on {
        return Err(CatalogError::InvalidViewDefinition(format!(
            "view {} is defined on itself",
            view.name
        )));
    }
    if matches!(&view.collation, Some(collation) if !collation.is_object()) {
        return Err(CatalogError::InvalidViewDefinition(format!(
            "collation of view {} is not a document",
            view.name
        )));
    }
    validate_pipeline(&view.pipeline)
}

/// View counters for one database.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ViewStats {
    /// Views outside system namespaces and internal databases.
    pub user_views: usize,
    /// Views in system namespaces or internal databases.
    pub internal_views: usize,
}

/// The view set of one database.
#[derive(Clone, Debug)]
pub struct ViewsForDatabase {
    views: OrdMap<Namespace, Arc<ViewDefinition>>,
    valid: bool,
    stats: ViewStats,
}

impl Default for ViewsForDatabase {
    fn default() -> Self {
        Self {
            views: OrdMap::new(),
            valid: true,
            stats: ViewStats::default(),
        }
    }
}

/// Result of re-reading a database's durable view records.
#[derive(Debug)]
pub struct ViewReload {
    /// Views accepted before the first invalid record, in durable order.
    pub loaded: Vec<Namespace>,
    /// The first invalid record's error; loading stopped there.
    pub error: Option<CatalogError>,
}

impl ViewReload {
    /// Whether every record loaded.
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

impl ViewsForDatabase {
    /// Builds a view set from durable records, stopping at the first record
    /// that fails to parse or validate. The valid prefix is kept and the set
    /// is marked invalid.
    pub fn load(
        db: &DatabaseName,
        records: &[Value],
        validator: &ViewValidator,
    ) -> (Self, ViewReload) {
        let mut views = Self::default();
        let mut loaded = Vec::new();
        let mut error = None;
        for record in records {
            let parsed = ViewDefinition::from_record(record).and_then(|view| {
                if view.name.db() != db {
                    return Err(CatalogError::InvalidViewDefinition(format!(
                        "view {} stored under database {db}",
                        view.name
                    )));
                }
                validator(&view)?;
                Ok(view)
            });
            match parsed {
                Ok(view) => {
                    loaded.push(view.name.clone());
                    views.insert(Arc::new(view));
                }
                Err(err) => {
                    warn!(db = %db, error = %err, loaded = loaded.len(), "catalog.views.reload.invalid");
                    views.valid = false;
                    error = Some(err);
                    break;
                }
            }
        }
        debug!(db = %db, loaded = loaded.len(), valid = views.valid, "catalog.views.reload");
        (views, ViewReload { loaded, error })
    }

    /// Looks up a view without checking the set's validity.
    pub fn get(&self, name: &Namespace) -> Option<&Arc<ViewDefinition>> {
        self.views.get(name)
    }

    /// Views in namespace order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ViewDefinition>> {
        self.views.values()
    }

    /// Whether the last reload accepted every record.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// View counters.
    pub fn stats(&self) -> ViewStats {
        self.stats
    }

    /// Number of views.
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Whether there are no views.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    fn count(&mut self, view: &ViewDefinition, delta: isize) {
        let slot = if view.name.is_internal() {
            &mut self.stats.internal_views
        } else {
            &mut self.stats.user_views
        };
        *slot = slot.saturating_add_signed(delta);
    }

    fn insert(&mut self, view: Arc<ViewDefinition>) {
        if let Some(previous) = self.views.insert(view.name.clone(), Arc::clone(&view)) {
            self.count(&previous, -1);
        }
        self.count(&view, 1);
    }

    fn remove(&mut self, name: &Namespace) -> Option<Arc<ViewDefinition>> {
        let removed = self.views.remove(name)?;
        self.count(&removed, -1);
        Some(removed)
    }
}

/// Shared profiling filter predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileFilter(pub Value);

/// Per-database profiling configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProfileSettings {
    level: u8,
    filter: Option<Arc<ProfileFilter>>,
}

impl ProfileSettings {
    /// Validates `level` (0 to 2) and builds the settings.
    pub fn new(level: i32, filter: Option<Arc<ProfileFilter>>) -> Result<Self> {
        let level = u8::try_from(level)
            .ok()
            .filter(|level| *level <= 2)
            .ok_or(CatalogError::InvalidProfileLevel(level))?;
        Ok(Self { level, filter })
    }

    /// Profiling level.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Filter predicate, if any.
    pub fn filter(&self) -> Option<&Arc<ProfileFilter>> {
        self.filter.as_ref()
    }
}

/// All view sets, the names reserved by in-flight view creations, and
/// profiling settings.
#[derive(Clone, Debug, Default)]
pub struct ViewStore {
    databases: HashMap<DatabaseName, Arc<ViewsForDatabase>>,
    uncommitted: HashSet<Namespace>,
    profiles: HashMap<DatabaseName, ProfileSettings>,
}

impl ViewStore {
    /// Looks up a view; fails when the database's view set is invalid.
    pub fn lookup(&self, name: &Namespace) -> Result<Option<Arc<ViewDefinition>>> {
        let Some(views) = self.databases.get(name.db()) else {
            return Ok(None);
        };
        if !views.is_valid() {
            return Err(CatalogError::InvalidViewDefinition(format!(
                "views of database {} are invalid; lookup of {name} refused",
                name.db()
            )));
        }
        Ok(views.get(name).cloned())
    }

    /// Looks up a view regardless of the set's validity.
    pub fn lookup_without_validating(&self, name: &Namespace) -> Option<Arc<ViewDefinition>> {
        self.databases
            .get(name.db())
            .and_then(|views| views.get(name))
            .cloned()
    }

    /// Whether a committed view or an in-flight reservation holds `name`.
    pub fn occupies(&self, name: &Namespace) -> bool {
        self.uncommitted.contains(name) || self.lookup_without_validating(name).is_some()
    }

    /// Whether an in-flight view creation reserved `name`.
    pub fn is_reserved(&self, name: &Namespace) -> bool {
        self.uncommitted.contains(name)
    }

    /// Reserves a name for an in-flight view creation.
    pub fn reserve(&mut self, name: &Namespace) -> Result<()> {
        if self.occupies(name) {
            return Err(CatalogError::NamespaceExists(name.clone()));
        }
        self.uncommitted.insert(name.clone());
        Ok(())
    }

    /// Releases a reservation.
    pub fn release(&mut self, name: &Namespace) {
        self.uncommitted.remove(name);
    }

    /// Inserts or replaces a view, releasing any reservation on its name.
    pub fn put(&mut self, view: Arc<ViewDefinition>) {
        self.uncommitted.remove(&view.name);
        let db = view.name.db().clone();
        let mut views = self
            .databases
            .get(&db)
            .map(|views| ViewsForDatabase::clone(views))
            .unwrap_or_default();
        views.insert(view);
        self.databases.insert(db, Arc::new(views));
    }

    /// Removes a view.
    pub fn remove(&mut self, name: &Namespace) -> Option<Arc<ViewDefinition>> {
        let views = self.databases.get(name.db())?;
        let mut views = ViewsForDatabase::clone(views);
        let removed = views.remove(name)?;
        self.databases.insert(name.db().clone(), Arc::new(views));
        Some(removed)
    }

    /// Installs a freshly loaded view set.
    pub fn replace_database(&mut self, db: DatabaseName, views: ViewsForDatabase) {
        self.databases.insert(db, Arc::new(views));
    }

    /// The view set of `db`.
    pub fn database(&self, db: &DatabaseName) -> Option<&Arc<ViewsForDatabase>> {
        self.databases.get(db)
    }

    /// Whether `db` has a loaded view set.
    pub fn is_loaded(&self, db: &DatabaseName) -> bool {
        self.databases.contains_key(db)
    }

    /// Forgets a database's views, e.g. when the database closes.
    pub fn clear_database(&mut self, db: &DatabaseName) {
        self.databases.remove(db);
    }

    /// Databases with a loaded view set, sorted.
    pub fn database_names(&self) -> Vec<DatabaseName> {
        let mut names: Vec<DatabaseName> = self.databases.keys().cloned().collect();
        names.sort();
        names
    }

    /// View counters of `db`.
    pub fn stats(&self, db: &DatabaseName) -> Option<ViewStats> {
        self.databases.get(db).map(|views| views.stats())
    }

    /// Profiling settings of `db`, or `default` when none were set.
    pub fn profile_settings(&self, db: &DatabaseName, default: &ProfileSettings) -> ProfileSettings {
        self.profiles
            .get(db)
            .cloned()
            .unwrap_or_else(|| default.clone())
    }

    /// Sets the profiling settings of `db`.
    pub fn set_profile_settings(&mut self, db: DatabaseName, settings: ProfileSettings) {
        self.profiles.insert(db, settings);
    }

    /// Replaces the filter of every database with explicit settings.
    pub fn set_all_profile_filters(&mut self, filter: Option<Arc<ProfileFilter>>) {
        let updated: HashMap<DatabaseName, ProfileSettings> = self
            .profiles
            .iter()
            .map(|(db, settings)| {
                (
                    db.clone(),
                    ProfileSettings {
                        level: settings.level,
                        filter: filter.clone(),
                    },
                )
            })
            .collect();
        self.profiles = updated;
    }

    /// Drops explicit profiling settings for `db`.
    pub fn clear_profile_settings(&mut self, db: &DatabaseName) {
        self.profiles.remove(db);
    }

    /// Drops every view set and reservation. Profiling settings survive.
    pub fn clear(&mut self) {
        self.databases = HashMap::new();
        self.uncommitted = HashSet::new();
    }
}
