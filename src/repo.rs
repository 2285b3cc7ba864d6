//! The repository storage contract and graph operations built on it.
//!
//! A repository stores three things: immutable content-addressed objects,
//! mutable refs naming entry points into the object graph, and HEAD, the
//! single ref considered "current".

use std::collections::{HashSet, VecDeque};

use crate::object::{Commit, Object, ObjectId, Tag, Tree};
use crate::{Error, Result};

/// Minimum storage contract required by the transfer protocol.
pub trait Repository: Send + Sync {
    /// Fetch the object with the given ID.
    fn get_object(&self, id: &ObjectId) -> Result<Object>;

    /// Store an object and return its ID. Storing the same object twice
    /// is idempotent; behavior on a SHA-1 collision is undefined.
    fn put_object(&self, obj: Object) -> Result<ObjectId>;

    /// The ID the named ref points to.
    fn get_ref(&self, name: &str) -> Result<ObjectId>;

    /// Atomically move the named ref from `old` to `new`. A zero `old`
    /// means the ref must not exist (create); a zero `new` deletes it;
    /// both zero asserts nonexistence. A nonzero `new` must name a
    /// stored object.
    fn update_ref(&self, name: &str, old: ObjectId, new: ObjectId) -> Result<()>;

    /// All refs, ascending byte-wise by name.
    fn list_refs(&self) -> Result<Vec<(String, ObjectId)>>;

    /// The refname HEAD designates.
    fn head(&self) -> Result<String>;

    /// Point HEAD at the named ref.
    fn set_head(&self, name: &str) -> Result<()>;
}

/// Whether `name` is a well-formed refname per the
/// git-check-ref-format(1) rules the server enforces.
pub fn is_valid_ref(name: &str) -> bool {
    name.starts_with("refs/")
        && !name.contains("/.")
        && !name.contains("..")
        && !name.bytes().any(|b| {
            b < 0x20
                || b == 0x7F
                || matches!(b, b' ' | b'~' | b'^' | b':' | b'?' | b'[' | b'\\')
        })
        && !name.ends_with('/')
        && !name.contains("//")
        && !name.ends_with('.')
        && !name.ends_with(".lock")
        && !name.contains("@{")
}

/// True iff an object with the given ID exists in the repository.
pub fn has_object(repo: &dyn Repository, id: &ObjectId) -> Result<bool> {
    match repo.get_object(id) {
        Ok(_) => Ok(true),
        Err(Error::ObjectNotExist(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Recursively dereference `id` to a commit, peeling annotated tags.
pub fn get_commit(repo: &dyn Repository, id: ObjectId) -> Result<(Commit, ObjectId)> {
    match repo.get_object(&id)? {
        Object::Commit(commit) => Ok((commit, id)),
        Object::Tag(tag) => get_commit(repo, tag.object),
        other => Err(Error::TypeMismatch {
            expected: "commit",
            found: other.kind(),
        }),
    }
}

/// Recursively dereference `id` to the innermost tag object, the one
/// whose target is not itself a tag.
pub fn get_tag(repo: &dyn Repository, id: ObjectId) -> Result<(Tag, ObjectId)> {
    match repo.get_object(&id)? {
        Object::Tag(tag) if tag.target_type == crate::object::ObjectType::Tag => {
            get_tag(repo, tag.object)
        }
        Object::Tag(tag) => Ok((tag, id)),
        other => Err(Error::TypeMismatch {
            expected: "tag",
            found: other.kind(),
        }),
    }
}

/// Recursively dereference `id` to a tree, peeling tags and commits.
pub fn get_tree(repo: &dyn Repository, id: ObjectId) -> Result<(Tree, ObjectId)> {
    match repo.get_object(&id)? {
        Object::Tree(tree) => Ok((tree, id)),
        Object::Commit(commit) => get_tree(repo, commit.tree),
        Object::Tag(tag) => get_tree(repo, tag.object),
        other => Err(Error::TypeMismatch {
            expected: "tree",
            found: other.kind(),
        }),
    }
}

/// Look up the object at a `/`-separated path below the tree hierarchy
/// rooted at `id`. An empty path (or "/") yields the root tree itself.
pub fn get_path(repo: &dyn Repository, id: ObjectId, path: &str) -> Result<(Object, ObjectId)> {
    let (tree, tree_id) = get_tree(repo, id)?;
    let mut obj = Object::Tree(tree);
    let mut obj_id = tree_id;
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        let tree = match obj {
            Object::Tree(tree) => tree,
            Object::Commit(commit) => get_tree(repo, commit.tree)?.0,
            other => {
                return Err(Error::TypeMismatch {
                    expected: "tree",
                    found: other.kind(),
                })
            }
        };
        let entry = tree
            .get(comp)
            .ok_or_else(|| Error::InvalidObject(format!("no such tree entry: {}", comp)))?;
        obj_id = entry.id;
        obj = repo.get_object(&obj_id)?;
    }
    Ok((obj, obj_id))
}

fn children(obj: &Object) -> Vec<ObjectId> {
    match obj {
        Object::Commit(commit) => {
            let mut ids = vec![commit.tree];
            ids.extend(commit.parents.iter().copied());
            ids
        }
        Object::Tree(tree) => tree.iter().map(|(_, entry)| entry.id).collect(),
        Object::Tag(tag) => vec![tag.object],
        Object::Blob(_) => Vec::new(),
    }
}

/// Breadth-first closure of the objects reachable from `wanted`, minus
/// everything reachable from `had`. Commits reach their tree and
/// parents, trees their entries, tags their target; blobs reach nothing.
pub fn reachable(
    repo: &dyn Repository,
    wanted: &[ObjectId],
    had: &[ObjectId],
) -> Result<Vec<(ObjectId, Object)>> {
    // The had closure stays out of the transfer set entirely: a client
    // holding a commit holds its trees and blobs too. Objects a had ref
    // names but the repository lacks are ignored.
    let mut visited: HashSet<ObjectId> = HashSet::new();
    let mut queue: VecDeque<ObjectId> = had.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        match repo.get_object(&id) {
            Ok(obj) => queue.extend(children(&obj)),
            Err(Error::ObjectNotExist(_)) => continue,
            Err(err) => return Err(err),
        }
    }

    let mut queue: VecDeque<ObjectId> = wanted.iter().copied().collect();
    let mut found = Vec::new();
    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        let obj = repo.get_object(&id)?;
        queue.extend(children(&obj));
        found.push((id, obj));
    }
    Ok(found)
}
