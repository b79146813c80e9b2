use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use anyhow::{anyhow, Context, Result};

use crate::blob::{new_shared_blob, SharedBlob};
use crate::error::RunError;
use crate::graph::{NetDef, OperatorDef, PlanDef};
use crate::net::{self, Net};
use crate::operator::Operator;
use crate::plan::{self, ShouldContinue};

/// Named blob store with optional parent read-through, plus ownership of
/// the nets constructed against it.
///
/// Children own their creations; a parent is read-only from the child's
/// perspective and must outlive it (enforced by the `Arc`). Lookups never
/// traverse into children.
pub struct Workspace {
    blobs: Mutex<HashMap<String, SharedBlob>>,
    nets: Mutex<HashMap<String, Arc<dyn Net>>>,
    parent: Option<Arc<Workspace>>,
    root_folder: Mutex<String>,
    self_ref: Weak<Workspace>,
}

impl Workspace {
    pub fn new() -> Arc<Workspace> {
        Arc::new_cyclic(|self_ref| Workspace {
            blobs: Mutex::new(HashMap::new()),
            nets: Mutex::new(HashMap::new()),
            parent: None,
            root_folder: Mutex::new(".".to_string()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn with_parent(parent: &Arc<Workspace>) -> Arc<Workspace> {
        Arc::new_cyclic(|self_ref| Workspace {
            blobs: Mutex::new(HashMap::new()),
            nets: Mutex::new(HashMap::new()),
            parent: Some(Arc::clone(parent)),
            root_folder: Mutex::new(parent.root_folder()),
            self_ref: self_ref.clone(),
        })
    }

    /// A strong handle to this workspace, for components that need to hold
    /// one beyond the current call.
    pub fn handle(&self) -> Arc<Workspace> {
        self.self_ref
            .upgrade()
            .expect("workspace accessed outside its Arc")
    }

    pub fn parent(&self) -> Option<&Arc<Workspace>> {
        self.parent.as_ref()
    }

    pub fn root_folder(&self) -> String {
        self.root_folder
            .lock()
            .expect("workspace lock poisoned")
            .clone()
    }

    pub fn set_root_folder(&self, folder: impl Into<String>) {
        *self.root_folder.lock().expect("workspace lock poisoned") = folder.into();
    }

    /// Idempotent creation: returns the existing blob when present anywhere
    /// on the parent chain, creating locally otherwise.
    pub fn create_blob(&self, name: &str) -> SharedBlob {
        if let Some(existing) = self.get_blob(name) {
            crate::trace!("blob {} already exists, skipping", name);
            return existing;
        }
        crate::trace!("creating blob {}", name);
        let blob = new_shared_blob();
        self.blobs
            .lock()
            .expect("workspace lock poisoned")
            .insert(name.to_string(), Arc::clone(&blob));
        blob
    }

    /// Creation that never resolves through the parent: used where a child
    /// scope must own its copy even under a colliding name.
    pub fn create_local_blob(&self, name: &str) -> SharedBlob {
        let mut blobs = self.blobs.lock().expect("workspace lock poisoned");
        if let Some(existing) = blobs.get(name) {
            return Arc::clone(existing);
        }
        let blob = new_shared_blob();
        blobs.insert(name.to_string(), Arc::clone(&blob));
        blob
    }

    /// Local lookup first, then the parent chain.
    pub fn get_blob(&self, name: &str) -> Option<SharedBlob> {
        if let Some(blob) = self
            .blobs
            .lock()
            .expect("workspace lock poisoned")
            .get(name)
        {
            return Some(Arc::clone(blob));
        }
        self.parent.as_ref().and_then(|parent| parent.get_blob(name))
    }

    pub fn require_blob(&self, name: &str) -> Result<SharedBlob> {
        self.get_blob(name)
            .ok_or_else(|| RunError::NotFound(format!("blob {}", name)).into())
    }

    pub fn has_blob(&self, name: &str) -> bool {
        self.get_blob(name).is_some()
    }

    pub fn local_blobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .blobs
            .lock()
            .expect("workspace lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Union of local and parent blob names.
    pub fn blobs(&self) -> Vec<String> {
        let mut names = self.local_blobs();
        if let Some(parent) = &self.parent {
            names.extend(parent.blobs());
        }
        names.sort();
        names.dedup();
        names
    }

    /// Construct a net from its definition, replacing any previous net of
    /// the same name. The old net is destroyed before construction starts so
    /// that exclusively held resources inside it are released first.
    pub fn create_net(&self, def: &NetDef) -> Result<Arc<dyn Net>> {
        if def.name.is_empty() {
            return Err(RunError::InvalidNet("net definition has no name".into()).into());
        }
        {
            let mut nets = self.nets.lock().expect("workspace lock poisoned");
            if nets.remove(&def.name).is_some() {
                crate::warning!("overwriting existing network {}", def.name);
            }
        }
        crate::trace!("initializing network {}", def.name);
        let net = net::create_net(def, &self.handle())
            .with_context(|| format!("constructing net {}", def.name))?;
        self.nets
            .lock()
            .expect("workspace lock poisoned")
            .insert(def.name.clone(), Arc::clone(&net));
        Ok(net)
    }

    pub fn get_net(&self, name: &str) -> Option<Arc<dyn Net>> {
        self.nets
            .lock()
            .expect("workspace lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn delete_net(&self, name: &str) {
        self.nets.lock().expect("workspace lock poisoned").remove(name);
    }

    pub fn run_net(&self, name: &str) -> Result<()> {
        let net = self
            .get_net(name)
            .ok_or_else(|| anyhow!(RunError::NotFound(format!("net {}", name))))?;
        net.run()
    }

    /// Construct and run a transient net, without keeping it.
    pub fn run_net_once(&self, def: &NetDef) -> Result<()> {
        let net = net::create_net(def, &self.handle())
            .with_context(|| format!("constructing net {}", def.name))?;
        net.run()
            .with_context(|| format!("running network {}", def.name))
    }

    /// Construct and run a single operator.
    pub fn run_operator_once(&self, def: &OperatorDef) -> Result<()> {
        let op = Operator::create(def, &self.handle(), None)
            .with_context(|| format!("creating operator of type {}", def.op_type))?;
        op.run()
            .with_context(|| format!("running operator {}", def.op_type))
    }

    pub fn run_plan(&self, plan: &PlanDef) -> Result<()> {
        plan::run_plan(self, plan, Arc::new(|_| true))
    }

    pub fn run_plan_with(&self, plan: &PlanDef, should_continue: ShouldContinue) -> Result<()> {
        plan::run_plan(self, plan, should_continue)
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("blobs", &self.local_blobs().len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
