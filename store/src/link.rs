use crate::error::{Error, Result};
use crate::id::{EntityId, MediaType, SpaceId};
use crate::path::PathBuf;
use crate::schema;
use crate::value::Value;
use fnv::FnvHashSet;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::sync::Arc;

/// Tag of the versioned link sigil.
pub const LINK_V1_TAG: &str = "link@1";

/// URI prefix of inline data links.
pub const DATA_URI_PREFIX: &str = "data:";

/// Target identifier of a link: either an entity or inline data.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum LinkId {
    /// A content-addressed entity.
    Entity(EntityId),
    /// A `data:` URI carrying an inlined value.
    Data(String),
}

impl LinkId {
    /// Returns the URI form.
    pub fn to_uri(&self) -> String {
        match self {
            Self::Entity(id) => id.to_uri(),
            Self::Data(uri) => uri.clone(),
        }
    }

    /// Parses an `of:` or `data:` URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        if uri.starts_with(DATA_URI_PREFIX) {
            Ok(Self::Data(uri.to_string()))
        } else {
            Ok(Self::Entity(EntityId::from_uri(uri)?))
        }
    }

    /// Returns the entity id, unless this is inline data.
    pub fn entity(&self) -> Option<EntityId> {
        if let Self::Entity(id) = self {
            Some(*id)
        } else {
            None
        }
    }

    /// Parses the inlined value of a `data:` link. The payload is the JSON
    /// text after the first comma.
    pub fn inline_value(&self) -> Option<Value> {
        if let Self::Data(uri) = self {
            let payload = uri.splitn(2, ',').nth(1)?;
            serde_json::from_str(payload).ok()
        } else {
            None
        }
    }
}

/// A reference from a value position to `(space, entity, path)`, optionally
/// carrying a schema context.
///
/// Equality is by target: `(space, id, path, media_type)`. The schema
/// context does not participate.
#[derive(Clone, Debug)]
pub struct Link {
    /// Target space; `None` inherits from context.
    pub space: Option<SpaceId>,
    /// Target identifier.
    pub id: LinkId,
    /// Position within the target document.
    pub path: PathBuf,
    /// Target media type.
    pub media_type: MediaType,
    /// Schema describing the value at `path`.
    pub schema: Option<Arc<Value>>,
    /// Root schema the `schema` was resolved against.
    pub root_schema: Option<Arc<Value>>,
}

impl Link {
    /// Creates a link to the root of an entity.
    pub fn to_entity(space: SpaceId, id: EntityId) -> Self {
        Self {
            space: Some(space),
            id: LinkId::Entity(id),
            path: PathBuf::new(),
            media_type: MediaType::Json,
            schema: None,
            root_schema: None,
        }
    }

    /// True if both links address the same `(space, id, path, media_type)`.
    pub fn same_target(&self, other: &Link) -> bool {
        self.space == other.space
            && self.id == other.id
            && self.path == other.path
            && self.media_type == other.media_type
    }

    /// Detects a sigil-form link object and parses it.
    ///
    /// The sigil shape is `{"/": {"link@1": {id, space?, path?, schema?,
    /// rootSchema?, mediaType?}}}`.
    pub fn from_sigil(value: &Value) -> Option<Link> {
        let outer = value.as_object()?;
        if outer.len() != 1 {
            return None;
        }
        let inner = outer.get("/")?.as_object()?;
        if inner.len() != 1 {
            return None;
        }
        let body = inner.get(LINK_V1_TAG)?.as_object()?;
        let id = LinkId::from_uri(body.get("id")?.as_str()?).ok()?;
        let space = match body.get("space") {
            Some(v) => Some(v.as_str()?.parse().ok()?),
            None => None,
        };
        let path = match body.get("path") {
            Some(Value::Array(components)) => components
                .iter()
                .map(|c| c.as_str().map(str::to_string))
                .collect::<Option<PathBuf>>()?,
            _ => PathBuf::new(),
        };
        let media_type = match body.get("mediaType") {
            Some(v) => v.as_str()?.parse().ok()?,
            None => MediaType::Json,
        };
        Some(Link {
            space,
            id,
            path,
            media_type,
            schema: body.get("schema").cloned().map(Arc::new),
            root_schema: body.get("rootSchema").cloned().map(Arc::new),
        })
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.same_target(other)
    }
}

impl Eq for Link {}

impl Serialize for Link {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Body<'a> {
            id: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            space: Option<&'a SpaceId>,
            #[serde(skip_serializing_if = "Option::is_none")]
            path: Option<&'a PathBuf>,
            #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
            media_type: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            schema: Option<&'a Value>,
            #[serde(rename = "rootSchema", skip_serializing_if = "Option::is_none")]
            root_schema: Option<&'a Value>,
        }
        #[derive(Serialize)]
        struct Tagged<'a> {
            #[serde(rename = "link@1")]
            link: Body<'a>,
        }
        let body = Body {
            id: self.id.to_uri(),
            space: self.space.as_ref(),
            path: if self.path.is_empty() { None } else { Some(&self.path) },
            media_type: if self.media_type.is_json() {
                None
            } else {
                Some(self.media_type.as_str().to_string())
            },
            schema: self.schema.as_deref(),
            root_schema: self.root_schema.as_deref(),
        };
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("/", &Tagged { link: body })?;
        map.end()
    }
}

/// Context used to fill in fields a link omits.
#[derive(Clone, Debug, Default)]
pub struct LinkContext {
    /// Space links without an explicit space resolve into.
    pub space: Option<SpaceId>,
    /// Root schema for relative schema resolution.
    pub root_schema: Option<Arc<Value>>,
}

/// A link with every contextual field resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedFullLink {
    /// Target space.
    pub space: SpaceId,
    /// Target identifier.
    pub id: LinkId,
    /// Position within the target document.
    pub path: PathBuf,
    /// Target media type.
    pub media_type: MediaType,
    /// Schema describing the value at `path`, if any.
    pub schema: Option<Arc<Value>>,
    /// Root schema the `schema` resolves against.
    pub root_schema: Option<Arc<Value>>,
}

impl NormalizedFullLink {
    /// Returns the storage address, unless this links to inline data.
    pub fn address(&self) -> Option<Address> {
        Some(Address {
            space: self.space.clone(),
            id: self.id.entity()?,
            media_type: self.media_type.clone(),
            path: self.path.clone(),
        })
    }

    /// Converts back to an embeddable link value.
    pub fn to_link(&self) -> Link {
        Link {
            space: Some(self.space.clone()),
            id: self.id.clone(),
            path: self.path.clone(),
            media_type: self.media_type.clone(),
            schema: self.schema.clone(),
            root_schema: self.root_schema.clone(),
        }
    }
}

/// The dependency key and read/write target of the transaction layer.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Address {
    /// Space of the entity.
    pub space: SpaceId,
    /// Entity identifier.
    pub id: EntityId,
    /// Media type of the document.
    pub media_type: MediaType,
    /// Position within the document.
    pub path: PathBuf,
}

impl Address {
    /// Creates a root address for an entity.
    pub fn root(space: SpaceId, id: EntityId) -> Self {
        Self {
            space,
            id,
            media_type: MediaType::Json,
            path: PathBuf::new(),
        }
    }

    /// Returns the address of `path` appended.
    pub fn at(&self, path: &PathBuf) -> Self {
        Self {
            path: self.path.join(path),
            ..self.clone()
        }
    }

    /// The per-document part of the address, without the path.
    pub fn doc_key(&self) -> (SpaceId, EntityId, MediaType) {
        (self.space.clone(), self.id, self.media_type.clone())
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.space
            .cmp(&other.space)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.media_type.cmp(&other.media_type))
            .then_with(|| crate::path::compare_paths(&self.path, &other.path))
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}{}", self.space, self.id.to_uri(), self.path)
    }
}

/// True if the value is a link, in variant or sigil form.
pub fn is_link(value: &Value) -> bool {
    matches!(value, Value::Link(_)) || Link::from_sigil(value).is_some()
}

/// Parses a link in any accepted form, filling missing fields from `ctx`.
///
/// Accepted forms: the `Link` variant, the versioned sigil object, and the
/// bare id sigil `{"/": "<hash-or-uri>"}`.
pub fn parse_link(value: &Value, ctx: &LinkContext) -> Result<NormalizedFullLink> {
    let link = match value {
        Value::Link(link) => link.clone(),
        other => match Link::from_sigil(other) {
            Some(link) => link,
            None => bare_id_link(other)
                .ok_or_else(|| Error::InvalidIdentity(format!("not a link: {}", other.kind())))?,
        },
    };
    normalize_link(&link, ctx)
}

fn bare_id_link(value: &Value) -> Option<Link> {
    let outer = value.as_object()?;
    if outer.len() != 1 {
        return None;
    }
    let id = EntityId::parse_flexible(outer.get("/")?.as_str()?).ok()?;
    Some(Link {
        space: None,
        id: LinkId::Entity(id),
        path: PathBuf::new(),
        media_type: MediaType::Json,
        schema: None,
        root_schema: None,
    })
}

/// Normalizes a link against its context.
pub fn normalize_link(link: &Link, ctx: &LinkContext) -> Result<NormalizedFullLink> {
    let space = link
        .space
        .clone()
        .or_else(|| ctx.space.clone())
        .ok_or_else(|| Error::InvalidIdentity("link is missing a space".into()))?;
    Ok(NormalizedFullLink {
        space,
        id: link.id.clone(),
        path: link.path.clone(),
        media_type: link.media_type.clone(),
        schema: link.schema.clone(),
        root_schema: link.root_schema.clone().or_else(|| ctx.root_schema.clone()),
    })
}

/// Cycle-safe traversal of a value, yielding every link position.
///
/// Links are yielded with the path where they sit, except `data:` links
/// whose inlined value is traversed instead. Object properties whose name
/// begins with `$` are reserved and skipped. When a schema is supplied it
/// is resolved alongside the descent; a position the schema marks `asCell`
/// is a link boundary and is not descended further.
pub fn traverse_links<F>(value: &Value, current_schema: Option<&Value>, root_schema: Option<&Value>, visitor: &mut F) -> Result<()>
where
    F: FnMut(&Link, &PathBuf) -> Result<()>,
{
    let mut seen = FnvHashSet::default();
    let mut path = PathBuf::new();
    traverse_inner(value, current_schema, root_schema, visitor, &mut seen, &mut path)
}

fn traverse_inner<F>(
    value: &Value,
    current_schema: Option<&Value>,
    root_schema: Option<&Value>,
    visitor: &mut F,
    seen: &mut FnvHashSet<String>,
    path: &mut PathBuf,
) -> Result<()>
where
    F: FnMut(&Link, &PathBuf) -> Result<()>,
{
    match value {
        Value::Link(link) => {
            if let LinkId::Data(uri) = &link.id {
                if !seen.insert(uri.clone()) {
                    return Ok(());
                }
                if let Some(inline) = link.id.inline_value() {
                    return traverse_inner(
                        &inline,
                        current_schema,
                        root_schema,
                        visitor,
                        seen,
                        path,
                    );
                }
                return Ok(());
            }
            visitor(link, path)
        }
        Value::Array(elements) => {
            for (ix, element) in elements.iter().enumerate() {
                let child_schema = current_schema
                    .and_then(|s| schema::schema_at_child(s, root_schema, &ix.to_string()));
                if child_schema.as_ref().map_or(false, schema::is_as_cell)
                    && !matches!(element, Value::Link(_))
                {
                    continue;
                }
                path.push_index(ix);
                traverse_inner(element, child_schema.as_ref(), root_schema, visitor, seen, path)?;
                path.pop();
            }
            Ok(())
        }
        Value::Object(properties) => {
            for (key, property) in properties {
                if key.starts_with('$') {
                    continue;
                }
                let child_schema =
                    current_schema.and_then(|s| schema::schema_at_child(s, root_schema, key));
                if child_schema.as_ref().map_or(false, schema::is_as_cell)
                    && !matches!(property, Value::Link(_))
                {
                    continue;
                }
                path.push(key.clone());
                traverse_inner(property, child_schema.as_ref(), root_schema, visitor, seen, path)?;
                path.pop();
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Returns the unique `(space, id)` links reachable from `value`, each with
/// the path where it was first found. This is the primitive sync uses to
/// expand document graphs.
pub fn discover_links(value: &Value, ctx: &LinkContext) -> Result<Vec<(NormalizedFullLink, PathBuf)>> {
    let mut found: Vec<(NormalizedFullLink, PathBuf)> = Vec::new();
    let mut unique: FnvHashSet<(SpaceId, EntityId)> = FnvHashSet::default();
    let root_schema = ctx.root_schema.clone();
    traverse_links(value, None, root_schema.as_deref(), &mut |link, path| {
        let normalized = normalize_link(link, ctx)?;
        if let LinkId::Entity(id) = &normalized.id {
            if unique.insert((normalized.space.clone(), *id)) {
                found.push((normalized, path.clone()));
            }
        }
        Ok(())
    })?;
    Ok(found)
}
