//! Name resolution over a parsed program.
//!
//! There is no type inference here: paths are resolved through `use` items,
//! `type` aliases, locally declared items and the standard prelude, each
//! scoped to the module declaring it. Method-call receivers are typed only
//! from explicit bindings.

use proc_macro2::{Spacing, Span, TokenStream, TokenTree};
use quote::ToTokens;
use std::cell::Cell;
use std::collections::{BTreeSet, HashMap, HashSet};
use syn::{
    punctuated::Punctuated,
    spanned::Spanned,
    visit::{self, Visit},
    Expr, ExprCall, ExprMethodCall, ExprPath, GenericArgument, ItemImpl, ItemMod, Local, Macro,
    Pat, PatType, PathArguments, Token, Type, UseTree,
};

use crate::types::{normalize_path, CallKind, CallSite, TypeRef};

const PRELUDE: &[(&str, &str)] = &[
    ("Vec", "std::vec::Vec"),
    ("String", "std::string::String"),
    ("Box", "std::boxed::Box"),
    ("Option", "std::option::Option"),
    ("Some", "std::option::Option::Some"),
    ("None", "std::option::Option::None"),
    ("Result", "std::result::Result"),
    ("Ok", "std::result::Result::Ok"),
    ("Err", "std::result::Result::Err"),
    ("ToString", "std::string::ToString"),
    ("ToOwned", "std::borrow::ToOwned"),
    ("Clone", "std::clone::Clone"),
    ("Default", "std::default::Default"),
    ("Iterator", "std::iter::Iterator"),
    ("IntoIterator", "std::iter::IntoIterator"),
    ("Extend", "std::iter::Extend"),
    ("From", "std::convert::From"),
    ("Into", "std::convert::Into"),
    ("drop", "std::mem::drop"),
];

const PRIMITIVES: &[&str] = &[
    "bool", "char", "str", "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32", "i64",
    "i128", "isize", "f32", "f64",
];

/// Associated functions assumed to return `Self`.
const CONSTRUCTORS: &[&str] = &["new", "default", "with_capacity", "from", "create", "open"];

const NON_CRATE_ROOTS: &[&str] = &["std", "core", "alloc", "crate", "self", "super", "Self"];

/// Lookups allowed while resolving a single path. Import cycles and deep
/// glob chains end as unresolved local paths.
const RESOLVE_STEPS: usize = 512;

#[derive(Debug, Clone, PartialEq)]
struct Segment {
    name: String,
    args: Vec<TypeRef>,
}

impl Segment {
    fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

fn split_path(path: &str) -> Vec<Segment> {
    normalize_path(path).split("::").map(Segment::plain).collect()
}

fn type_segments(ty: &TypeRef) -> Vec<Segment> {
    let mut segments = split_path(&ty.path);
    if let Some(last) = segments.last_mut() {
        last.args = ty.generic_args.clone();
    }
    segments
}

fn join(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join("::")
}

fn resolved_type(segments: &[Segment]) -> TypeRef {
    let args = segments.last().map(|s| s.args.clone()).unwrap_or_default();
    TypeRef::with_args(join(segments), args)
}

/// Turn resolved segments into `(container, method)`.
fn split_call(segments: &[Segment]) -> Option<(TypeRef, String)> {
    let (method, container) = segments.split_last()?;
    let owner = container.last()?;
    Some((
        TypeRef::with_args(join(container), owner.args.clone()),
        method.name.clone(),
    ))
}

/// Put `target` in place of the first written segment.
fn substitute(target: Vec<Segment>, written: &[Segment]) -> Vec<Segment> {
    let mut resolved = target;
    if let (Some(last), Some(first)) = (resolved.last_mut(), written.first()) {
        if !first.args.is_empty() {
            last.args = first.args.clone();
        }
    }
    resolved.extend(written.iter().skip(1).cloned());
    resolved
}

fn local_path(module: &[String], rest: &[Segment]) -> Vec<Segment> {
    let mut path = vec![Segment::plain("crate")];
    path.extend(module.iter().map(Segment::plain));
    path.extend(rest.iter().cloned());
    path
}

fn parent(module: &[String]) -> &[String] {
    &module[..module.len().saturating_sub(1)]
}

fn child(module: &[String], name: &str) -> Vec<String> {
    let mut path = module.to_vec();
    path.push(name.to_string());
    path
}

fn prelude(name: &str) -> Option<&'static str> {
    PRELUDE
        .iter()
        .find(|(short, _)| *short == name)
        .map(|(_, full)| *full)
}

struct Budget(Cell<usize>);

impl Budget {
    fn new() -> Self {
        Budget(Cell::new(RESOLVE_STEPS))
    }

    fn spend(&self) -> bool {
        let left = self.0.get();
        self.0.set(left.saturating_sub(1));
        left > 0
    }
}

/// Names declared by one module. `use` items and items inside function
/// bodies count towards the enclosing module.
#[derive(Debug, Clone, Default)]
struct Scope {
    imports: HashMap<String, Vec<Segment>>,
    globs: Vec<Vec<Segment>>,
    items: HashSet<String>,
    modules: HashSet<String>,
}

/// Resolution tables and call sites for one program.
#[derive(Debug, Clone, Default)]
pub struct SemanticModel {
    scopes: HashMap<Vec<String>, Scope>,
    local_names: HashSet<String>,
    call_sites: Vec<CallSite>,
    namespaces: BTreeSet<String>,
}

impl SemanticModel {
    pub fn build(file: &syn::File) -> Self {
        let mut model = SemanticModel::default();
        model.scopes.insert(Vec::new(), Scope::default());

        let aliases = {
            let mut items = ItemCollector {
                model: &mut model,
                module: Vec::new(),
                aliases: Vec::new(),
            };
            items.visit_file(file);
            items.aliases
        };
        for (module, name, ty) in aliases {
            let resolved = model.resolve_type(ty, &module, None);
            model
                .scope_mut(&module)
                .imports
                .insert(name, type_segments(&resolved));
        }
        // `use` items may precede the `mod` they import from.
        model
            .namespaces
            .retain(|name| !model.local_names.contains(name));

        let (sites, namespaces) = {
            let mut calls = CallCollector {
                model: &model,
                module: Vec::new(),
                locals: HashMap::new(),
                self_ty: None,
                sites: Vec::new(),
                namespaces: BTreeSet::new(),
            };
            calls.visit_file(file);
            (calls.sites, calls.namespaces)
        };
        model.call_sites = sites;
        model.namespaces.extend(namespaces);
        model
    }

    /// Call sites in source order.
    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    /// External crate roots the program refers to.
    pub fn referenced_namespaces(&self) -> &BTreeSet<String> {
        &self.namespaces
    }

    /// Resolve a path as it would be written at the crate root, e.g. `File`
    /// or `fs::File` under `use std::fs::{self, File};`.
    pub fn resolve_path(&self, written: &str) -> Option<TypeRef> {
        let ty: TypeRef = written.parse().ok()?;
        let resolved = self.resolve_segments(&[], type_segments(&ty), None);
        resolved.first().map(|path| resolved_type(path))
    }

    /// Look up a fully qualified type name, independent of the program's
    /// imports. Only prelude names are expanded.
    pub fn lookup_type(&self, name: &str) -> TypeRef {
        match prelude(name) {
            Some(full) => TypeRef::new(full),
            None => TypeRef::new(name),
        }
    }

    /// Close an open generic type over `args`.
    pub fn construct(&self, open: &TypeRef, args: Vec<TypeRef>) -> TypeRef {
        TypeRef::with_args(&open.path, args)
    }

    /// Canonical form of a (possibly generic) type given by full name.
    pub fn canonical_type(&self, ty: &TypeRef) -> TypeRef {
        let open = self.lookup_type(&ty.path);
        if ty.generic_args.is_empty() {
            return open;
        }
        let args = ty
            .generic_args
            .iter()
            .map(|arg| self.canonical_type(arg))
            .collect();
        self.construct(&open, args)
    }

    /// Whether the call site points into this program at something no
    /// module declares, such as an item generated by a macro or a `use`
    /// chain that never reaches an item.
    pub fn is_unresolved(&self, site: &CallSite) -> bool {
        let mut names = site
            .container
            .path
            .split("::")
            .chain(std::iter::once(site.method.as_str()));
        if names.next() != Some("crate") {
            return false;
        }
        let mut module: Vec<String> = Vec::new();
        for name in names {
            let Some(scope) = self.scope(&module) else {
                return true;
            };
            if scope.items.contains(name) {
                return false;
            }
            if !scope.modules.contains(name) {
                return true;
            }
            module.push(name.to_string());
        }
        false
    }

    fn scope(&self, module: &[String]) -> Option<&Scope> {
        self.scopes.get(module)
    }

    fn scope_mut(&mut self, module: &[String]) -> &mut Scope {
        self.scopes.entry(module.to_vec()).or_default()
    }

    fn knows(&self, module: &[String], name: &str) -> bool {
        prelude(name).is_some()
            || self.scope(module).map_or(false, |scope| {
                scope.imports.contains_key(name)
                    || scope.items.contains(name)
                    || scope.modules.contains(name)
            })
    }

    fn is_crate_root(&self, name: &str) -> bool {
        !NON_CRATE_ROOTS.contains(&name)
            && !PRIMITIVES.contains(&name)
            && !self.local_names.contains(name)
            && name
                .chars()
                .next()
                .map_or(false, |c| c.is_ascii_lowercase() || c == '_')
    }

    fn note_namespace(&mut self, root: &str) {
        if self.is_crate_root(root) {
            self.namespaces.insert(root.to_string());
        }
    }

    fn import(&mut self, module: &[String], alias: String, full: Vec<String>) {
        if alias == "_" || full.is_empty() {
            return;
        }
        self.note_namespace(&full[0]);
        let segments = full.into_iter().map(Segment::plain).collect();
        self.scope_mut(module).imports.insert(alias, segments);
    }

    fn collect_use(&mut self, module: &[String], prefix: &mut Vec<String>, tree: &UseTree) {
        match tree {
            UseTree::Path(path) => {
                prefix.push(path.ident.to_string());
                self.collect_use(module, prefix, &path.tree);
                prefix.pop();
            }
            UseTree::Name(name) => {
                let ident = name.ident.to_string();
                if ident == "self" {
                    if let Some(last) = prefix.last().cloned() {
                        self.import(module, last, prefix.clone());
                    }
                } else {
                    let mut full = prefix.clone();
                    full.push(ident.clone());
                    self.import(module, ident, full);
                }
            }
            UseTree::Rename(rename) => {
                let ident = rename.ident.to_string();
                let mut full = prefix.clone();
                if ident != "self" {
                    full.push(ident);
                }
                self.import(module, rename.rename.to_string(), full);
            }
            UseTree::Glob(_) => {
                if let Some(root) = prefix.first().cloned() {
                    self.note_namespace(&root);
                }
                self.scope_mut(module)
                    .globs
                    .push(prefix.iter().map(Segment::plain).collect());
            }
            UseTree::Group(group) => {
                for item in &group.items {
                    self.collect_use(module, prefix, item);
                }
            }
        }
    }

    /// Candidate full paths for `segments` written inside `module`, most
    /// likely first. There is more than one only when glob imports are in
    /// scope.
    fn resolve_segments(
        &self,
        module: &[String],
        segments: Vec<Segment>,
        self_ty: Option<&TypeRef>,
    ) -> Vec<Vec<Segment>> {
        self.resolve_scoped(module, segments, self_ty, None, &Budget::new())
    }

    /// `skip_import` is the name of the `use` item whose own target is being
    /// resolved, so `use serde_json;` refers to the crate and not to itself.
    fn resolve_scoped(
        &self,
        module: &[String],
        segments: Vec<Segment>,
        self_ty: Option<&TypeRef>,
        skip_import: Option<&str>,
        budget: &Budget,
    ) -> Vec<Vec<Segment>> {
        let Some(first) = segments.first() else {
            return Vec::new();
        };
        let name = first.name.clone();
        if !budget.spend() {
            return vec![local_path(module, &segments)];
        }

        match name.as_str() {
            "crate" => return self.resolve_member(&[], &segments[1..], budget),
            "self" => return self.resolve_member(module, &segments[1..], budget),
            "super" => return self.resolve_member(parent(module), &segments[1..], budget),
            "Self" => {
                if let Some(self_ty) = self_ty {
                    return vec![substitute(type_segments(self_ty), &segments)];
                }
            }
            _ => {}
        }

        if let Some(scope) = self.scope(module) {
            if skip_import != Some(name.as_str()) {
                if let Some(target) = scope.imports.get(&name) {
                    return self.resolve_import(module, &name, target, &segments, budget);
                }
            }
            if scope.modules.contains(&name) {
                return self.resolve_member(&child(module, &name), &segments[1..], budget);
            }
            if scope.items.contains(&name) {
                return vec![local_path(module, &segments)];
            }
        }
        if let Some(full) = prelude(&name) {
            return vec![substitute(split_path(full), &segments)];
        }

        let mut candidates = Vec::new();
        if !PRIMITIVES.contains(&name.as_str()) && !NON_CRATE_ROOTS.contains(&name.as_str()) {
            candidates = self.glob_candidates(module, &segments, budget);
        }

        // `module::item` paths most likely name a crate, so the literal
        // reading goes first; bare type names prefer the glob readings.
        let literal_first =
            segments.len() > 1 && name.starts_with(|c: char| c.is_ascii_lowercase());

        let mut literal = segments;
        if literal[0].name == "core" || literal[0].name == "alloc" {
            literal[0].name = "std".to_string();
        }
        if literal_first {
            candidates.insert(0, literal);
        } else {
            candidates.push(literal);
        }
        candidates
    }

    fn resolve_import(
        &self,
        module: &[String],
        name: &str,
        target: &[Segment],
        written: &[Segment],
        budget: &Budget,
    ) -> Vec<Vec<Segment>> {
        self.resolve_scoped(module, target.to_vec(), None, Some(name), budget)
            .into_iter()
            .map(|resolved| substitute(resolved, written))
            .collect()
    }

    /// Resolve `rest` as a path inside the local module `module`. Names the
    /// module does not declare are kept as `crate::..` paths.
    fn resolve_member(
        &self,
        module: &[String],
        rest: &[Segment],
        budget: &Budget,
    ) -> Vec<Vec<Segment>> {
        match rest.first() {
            None => vec![local_path(module, rest)],
            Some(first) if first.name == "super" => {
                self.resolve_member(parent(module), &rest[1..], budget)
            }
            Some(_) => self
                .find_member(module, rest, budget)
                .unwrap_or_else(|| vec![local_path(module, rest)]),
        }
    }

    fn find_member(
        &self,
        module: &[String],
        rest: &[Segment],
        budget: &Budget,
    ) -> Option<Vec<Vec<Segment>>> {
        let name = rest.first()?.name.as_str();
        if !budget.spend() {
            return Some(vec![local_path(module, rest)]);
        }
        let scope = self.scope(module)?;
        if let Some(target) = scope.imports.get(name) {
            return Some(self.resolve_import(module, name, target, rest, budget));
        }
        if scope.modules.contains(name) {
            return Some(self.resolve_member(&child(module, name), &rest[1..], budget));
        }
        if scope.items.contains(name) {
            return Some(vec![local_path(module, rest)]);
        }
        let found = self.glob_candidates(module, rest, budget);
        (!found.is_empty()).then_some(found)
    }

    /// Readings of `written` through the glob imports of `module`. A glob
    /// over a local module only contributes names that module declares.
    fn glob_candidates(
        &self,
        module: &[String],
        written: &[Segment],
        budget: &Budget,
    ) -> Vec<Vec<Segment>> {
        let Some(scope) = self.scope(module) else {
            return Vec::new();
        };
        let mut candidates = Vec::new();
        for glob in &scope.globs {
            for prefix in self.resolve_scoped(module, glob.clone(), None, None, budget) {
                match self.local_module(&prefix) {
                    Some(target) => {
                        if let Some(found) = self.find_member(&target, written, budget) {
                            candidates.extend(found);
                        }
                    }
                    None => {
                        let mut candidate = prefix;
                        candidate.extend(written.iter().cloned());
                        candidates.push(candidate);
                    }
                }
            }
        }
        candidates
    }

    /// The module a resolved `crate::..` path names, if it names one.
    fn local_module(&self, path: &[Segment]) -> Option<Vec<String>> {
        let (root, rest) = path.split_first()?;
        if root.name != "crate" {
            return None;
        }
        let module: Vec<String> = rest.iter().map(|s| s.name.clone()).collect();
        self.scopes.contains_key(&module).then_some(module)
    }

    fn path_segments(
        &self,
        path: &syn::Path,
        module: &[String],
        self_ty: Option<&TypeRef>,
    ) -> Vec<Segment> {
        path.segments
            .iter()
            .map(|segment| {
                let args = match &segment.arguments {
                    PathArguments::AngleBracketed(angle) => angle
                        .args
                        .iter()
                        .filter_map(|arg| match arg {
                            GenericArgument::Type(ty) => {
                                Some(self.resolve_type(ty, module, self_ty))
                            }
                            _ => None,
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                Segment {
                    name: segment.ident.to_string(),
                    args,
                }
            })
            .collect()
    }

    fn resolve_type(&self, ty: &Type, module: &[String], self_ty: Option<&TypeRef>) -> TypeRef {
        match ty {
            Type::Path(type_path) if type_path.qself.is_none() => {
                let segments = self.path_segments(&type_path.path, module, self_ty);
                match self
                    .resolve_segments(module, segments, self_ty)
                    .into_iter()
                    .next()
                {
                    Some(resolved) => resolved_type(&resolved),
                    None => TypeRef::new(type_path.to_token_stream().to_string()),
                }
            }
            Type::Reference(reference) => self.resolve_type(&reference.elem, module, self_ty),
            Type::Paren(paren) => self.resolve_type(&paren.elem, module, self_ty),
            Type::Group(group) => self.resolve_type(&group.elem, module, self_ty),
            Type::Ptr(ptr) => self.resolve_type(&ptr.elem, module, self_ty),
            other => TypeRef::new(other.to_token_stream().to_string()),
        }
    }
}

/// Paths in a raw token stream: `a::b::c` runs and lone identifiers,
/// including those inside nested groups. Runs through a `$metavariable`
/// are dropped since their expansion is unknown; `$crate` reads as `crate`.
#[derive(Default)]
struct TokenPaths {
    paths: Vec<(Vec<String>, Span)>,
    names: Vec<String>,
    span: Option<Span>,
    colons: u8,
    dollar: bool,
    opaque: bool,
}

impl TokenPaths {
    fn scan(tokens: TokenStream) -> Vec<(Vec<String>, Span)> {
        let mut scanner = TokenPaths::default();
        scanner.walk(tokens);
        scanner.flush();
        scanner.paths
    }

    fn walk(&mut self, tokens: TokenStream) {
        for tree in tokens {
            match tree {
                TokenTree::Ident(ident) => self.ident(ident.to_string(), ident.span()),
                TokenTree::Punct(punct) if punct.as_char() == ':' => {
                    if self.colons == 0 && punct.spacing() == Spacing::Joint {
                        self.colons = 1;
                    } else if self.colons == 1 {
                        self.colons = 2;
                    } else {
                        self.flush();
                    }
                }
                TokenTree::Punct(punct) if punct.as_char() == '$' => {
                    self.flush();
                    self.dollar = true;
                }
                TokenTree::Group(group) => {
                    self.flush();
                    self.walk(group.stream());
                    self.flush();
                }
                _ => self.flush(),
            }
        }
    }

    fn ident(&mut self, name: String, span: Span) {
        if self.dollar {
            self.flush();
            self.opaque = name != "crate";
        } else if self.colons == 2 {
            self.colons = 0;
            self.names.push(name);
            self.span.get_or_insert(span);
            return;
        } else {
            self.flush();
        }
        self.names.push(name);
        self.span = Some(span);
    }

    fn flush(&mut self) {
        let names = std::mem::take(&mut self.names);
        if let Some(span) = self.span.take() {
            if !self.opaque && !names.is_empty() {
                self.paths.push((names, span));
            }
        }
        self.colons = 0;
        self.dollar = false;
        self.opaque = false;
    }
}

/// First pass: imports, aliases and local item names, per module.
struct ItemCollector<'m, 'ast> {
    model: &'m mut SemanticModel,
    module: Vec<String>,
    aliases: Vec<(Vec<String>, String, &'ast Type)>,
}

impl<'m, 'ast> ItemCollector<'m, 'ast> {
    fn declare(&mut self, ident: &syn::Ident) {
        let name = ident.to_string();
        self.model.local_names.insert(name.clone());
        self.model.scope_mut(&self.module).items.insert(name);
    }
}

impl<'m, 'ast> Visit<'ast> for ItemCollector<'m, 'ast> {
    fn visit_item_use(&mut self, item: &'ast syn::ItemUse) {
        self.model
            .collect_use(&self.module, &mut Vec::new(), &item.tree);
    }

    fn visit_item_extern_crate(&mut self, item: &'ast syn::ItemExternCrate) {
        let name = item.ident.to_string();
        self.model.note_namespace(&name);
        if let Some((_, rename)) = &item.rename {
            self.model
                .import(&self.module, rename.to_string(), vec![name]);
        }
    }

    fn visit_item_type(&mut self, item: &'ast syn::ItemType) {
        self.aliases
            .push((self.module.clone(), item.ident.to_string(), &*item.ty));
    }

    fn visit_item_fn(&mut self, item: &'ast syn::ItemFn) {
        self.declare(&item.sig.ident);
        visit::visit_item_fn(self, item);
    }

    fn visit_item_struct(&mut self, item: &'ast syn::ItemStruct) {
        self.declare(&item.ident);
    }

    fn visit_item_enum(&mut self, item: &'ast syn::ItemEnum) {
        self.declare(&item.ident);
    }

    fn visit_item_union(&mut self, item: &'ast syn::ItemUnion) {
        self.declare(&item.ident);
    }

    fn visit_item_trait(&mut self, item: &'ast syn::ItemTrait) {
        self.declare(&item.ident);
        visit::visit_item_trait(self, item);
    }

    fn visit_item_mod(&mut self, item: &'ast ItemMod) {
        let name = item.ident.to_string();
        self.model.local_names.insert(name.clone());
        self.model
            .scope_mut(&self.module)
            .modules
            .insert(name.clone());
        self.module.push(name);
        self.model.scopes.entry(self.module.clone()).or_default();
        visit::visit_item_mod(self, item);
        self.module.pop();
    }

    fn visit_item_const(&mut self, item: &'ast syn::ItemConst) {
        self.declare(&item.ident);
        visit::visit_item_const(self, item);
    }

    fn visit_item_static(&mut self, item: &'ast syn::ItemStatic) {
        self.declare(&item.ident);
        visit::visit_item_static(self, item);
    }
}

/// Second pass: every call, typed method call and function reference.
struct CallCollector<'m> {
    model: &'m SemanticModel,
    module: Vec<String>,
    locals: HashMap<String, TypeRef>,
    self_ty: Option<TypeRef>,
    sites: Vec<CallSite>,
    namespaces: BTreeSet<String>,
}

impl<'m> CallCollector<'m> {
    fn push(&mut self, container: TypeRef, method: String, kind: CallKind, span: Span) {
        let start = span.start();
        if let Some(root) = container.path.split("::").next() {
            if self.model.is_crate_root(root) {
                self.namespaces.insert(root.to_string());
            }
        }
        self.sites.push(CallSite {
            container,
            method,
            kind,
            line: start.line,
            column: start.column + 1,
        });
    }

    fn resolve(&self, segments: Vec<Segment>) -> Vec<Vec<Segment>> {
        self.model
            .resolve_segments(&self.module, segments, self.self_ty.as_ref())
    }

    fn segments(&self, path: &syn::Path) -> Vec<Segment> {
        self.model
            .path_segments(path, &self.module, self.self_ty.as_ref())
    }

    fn record_path(&mut self, expr: &ExprPath, kind: CallKind) {
        let span = expr.span();

        if let Some(qself) = &expr.qself {
            let Some(method) = expr.path.segments.last().map(|s| s.ident.to_string()) else {
                return;
            };
            if qself.position > 0 {
                let mut segments = self.segments(&expr.path);
                segments.truncate(qself.position);
                if let Some(resolved) = self.resolve(segments).into_iter().next() {
                    self.push(resolved_type(&resolved), method.clone(), kind, span);
                }
            }
            let owner = self
                .model
                .resolve_type(&qself.ty, &self.module, self.self_ty.as_ref());
            self.push(owner, method, kind, span);
            return;
        }

        let segments = self.segments(&expr.path);
        if kind == CallKind::Reference
            && segments.len() == 1
            && !self.model.knows(&self.module, &segments[0].name)
        {
            // A local variable or parameter.
            return;
        }
        for candidate in self.resolve(segments) {
            if let Some((container, method)) = split_call(&candidate) {
                self.push(container, method, kind, span);
            }
        }
    }

    /// Record the paths of a macro body that syn cannot parse. Lone names
    /// count only when the module knows them.
    fn record_tokens(&mut self, tokens: TokenStream) {
        for (names, span) in TokenPaths::scan(tokens) {
            if names.len() == 1 && !self.model.knows(&self.module, &names[0]) {
                continue;
            }
            let segments = names.into_iter().map(Segment::plain).collect();
            for candidate in self.resolve(segments) {
                if let Some((container, method)) = split_call(&candidate) {
                    self.push(container, method, CallKind::Macro, span);
                }
            }
        }
    }

    /// Type of `Type::new(..)`-style expressions, looking through `?`,
    /// `.unwrap()` and `.expect(..)`.
    fn constructed_type(&self, expr: &Expr) -> Option<TypeRef> {
        match expr {
            Expr::Try(inner) => self.constructed_type(&inner.expr),
            Expr::Paren(inner) => self.constructed_type(&inner.expr),
            Expr::MethodCall(call) if call.method == "unwrap" || call.method == "expect" => {
                self.constructed_type(&call.receiver)
            }
            Expr::Call(call) => {
                let Expr::Path(path) = &*call.func else {
                    return None;
                };
                if path.qself.is_some() {
                    return None;
                }
                let resolved = self.resolve(self.segments(&path.path)).into_iter().next()?;
                let (container, method) = split_call(&resolved)?;
                CONSTRUCTORS
                    .contains(&method.as_str())
                    .then_some(container)
            }
            Expr::Struct(strukt) => {
                let resolved = self.resolve(self.segments(&strukt.path)).into_iter().next()?;
                Some(TypeRef::new(join(&resolved)))
            }
            _ => None,
        }
    }

    fn receiver_type(&self, expr: &Expr) -> Option<TypeRef> {
        match expr {
            Expr::Path(path) if path.qself.is_none() => {
                let ident = path.path.get_ident()?.to_string();
                if ident == "self" {
                    return self.self_ty.clone();
                }
                self.locals.get(&ident).cloned()
            }
            Expr::Paren(inner) => self.receiver_type(&inner.expr),
            Expr::Reference(inner) => self.receiver_type(&inner.expr),
            _ => None,
        }
    }
}

impl<'ast, 'm> Visit<'ast> for CallCollector<'m> {
    fn visit_item_mod(&mut self, item: &'ast ItemMod) {
        self.module.push(item.ident.to_string());
        visit::visit_item_mod(self, item);
        self.module.pop();
    }

    fn visit_item_impl(&mut self, item: &'ast ItemImpl) {
        let self_ty = self.model.resolve_type(&item.self_ty, &self.module, None);
        let previous = self.self_ty.replace(self_ty);
        visit::visit_item_impl(self, item);
        self.self_ty = previous;
    }

    fn visit_pat_type(&mut self, pat: &'ast PatType) {
        if let Pat::Ident(ident) = &*pat.pat {
            let ty = self
                .model
                .resolve_type(&pat.ty, &self.module, self.self_ty.as_ref());
            self.locals.insert(ident.ident.to_string(), ty);
        }
        visit::visit_pat_type(self, pat);
    }

    fn visit_local(&mut self, local: &'ast Local) {
        if let (Pat::Ident(ident), Some(init)) = (&local.pat, &local.init) {
            if let Some(ty) = self.constructed_type(&init.expr) {
                self.locals.insert(ident.ident.to_string(), ty);
            }
        }
        visit::visit_local(self, local);
    }

    fn visit_expr_call(&mut self, call: &'ast ExprCall) {
        match &*call.func {
            Expr::Path(path) => self.record_path(path, CallKind::Path),
            other => self.visit_expr(other),
        }
        for arg in &call.args {
            self.visit_expr(arg);
        }
    }

    fn visit_expr_method_call(&mut self, call: &'ast ExprMethodCall) {
        if let Some(container) = self.receiver_type(&call.receiver) {
            self.push(
                container,
                call.method.to_string(),
                CallKind::Method,
                call.method.span(),
            );
        }
        self.visit_expr(&call.receiver);
        for arg in &call.args {
            self.visit_expr(arg);
        }
    }

    fn visit_expr_path(&mut self, path: &'ast ExprPath) {
        self.record_path(path, CallKind::Reference);
    }

    fn visit_macro(&mut self, mac: &'ast Macro) {
        // Expression lists (println!, format!, vec![..]) are walked as
        // expressions. Anything else, `macro_rules!` arms included, is
        // scanned token by token.
        match mac.parse_body_with(Punctuated::<Expr, Token![,]>::parse_terminated) {
            Ok(args) => {
                for arg in &args {
                    self.visit_expr(arg);
                }
            }
            Err(_) => self.record_tokens(mac.tokens.clone()),
        }
        visit::visit_macro(self, mac);
    }
}
