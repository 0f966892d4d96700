use connector_core::system::context::ServiceHandle;
use connector_core::{
    BootError, CapabilityId, ExtensionLoader, ExtensionResult, InjectionContainer, LifecycleLimits,
    LogMonitor,
    ManifestServiceLocator, Requirement, ServiceExtension, ServiceExtensionContext, TypeManager,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type Journal = Arc<Mutex<Vec<(String, &'static str)>>>;

struct Node {
    name: String,
    provides: Vec<CapabilityId>,
    requires: Vec<Requirement>,
    journal: Journal,
}

impl Node {
    fn record(&self, phase: &'static str) {
        self.journal
            .lock()
            .expect("journal lock")
            .push((self.name.clone(), phase));
    }
}

impl ServiceExtension for Node {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> Vec<CapabilityId> {
        self.provides.clone()
    }

    fn requires(&self) -> Vec<Requirement> {
        self.requires.clone()
    }

    fn initialize(&mut self, context: &mut ServiceExtensionContext) -> ExtensionResult {
        for capability in &self.provides {
            context.register_service_handle(
                capability.clone(),
                ServiceHandle::new(Arc::new(self.name.clone())),
            );
        }
        self.record("initialize");
        Ok(())
    }

    fn start(&mut self) -> ExtensionResult {
        self.record("start");
        Ok(())
    }

    fn shutdown(&mut self) -> ExtensionResult {
        self.record("shutdown");
        Ok(())
    }
}

fn context() -> ServiceExtensionContext {
    ServiceExtensionContext::new(
        Arc::new(TypeManager::new()),
        Arc::new(LogMonitor),
        Box::new(ManifestServiceLocator::with_entries(&[])),
    )
}

/// Deterministic pseudo-random generator for module sets.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % bound.max(1)
    }
}

/// Module `i` may only depend on modules `j < i`, so the set is acyclic.
/// Returns the modules shuffled together with each module's requirements.
fn acyclic_set(
    seed: u64,
    journal: &Journal,
) -> (Vec<InjectionContainer>, BTreeMap<String, Vec<String>>) {
    let mut rng = Lcg(seed);
    let count = 1 + rng.next(8);
    let mut nodes = Vec::new();
    let mut requirements = BTreeMap::new();
    for index in 0..count {
        let name = format!("m{index}");
        let mut requires = Vec::new();
        let mut depends_on = Vec::new();
        for dependency in 0..index {
            if rng.next(3) == 0 {
                requires.push(Requirement::required(CapabilityId::from(format!(
                    "test:cap-{dependency}"
                ))));
                depends_on.push(format!("m{dependency}"));
            }
        }
        requirements.insert(name.clone(), depends_on);
        nodes.push(Node {
            name,
            provides: vec![CapabilityId::from(format!("test:cap-{index}"))],
            requires,
            journal: journal.clone(),
        });
    }
    for index in (1..nodes.len()).rev() {
        let other = rng.next(index + 1);
        nodes.swap(index, other);
    }
    let containers = nodes
        .into_iter()
        .map(|node| InjectionContainer::new(Box::new(node)))
        .collect();
    (containers, requirements)
}

#[test]
fn every_acyclic_set_boots_in_dependency_order() {
    for seed in 0..64 {
        let journal = Journal::default();
        let (extensions, requirements) = acyclic_set(seed, &journal);
        let count = extensions.len();

        let booted = ExtensionLoader::new()
            .boot(&mut context(), extensions)
            .expect("acyclic set must boot");
        assert_eq!(booted.len(), count);

        let entries = journal.lock().expect("journal lock").clone();
        let initialized: Vec<&str> = entries
            .iter()
            .filter(|(_, phase)| *phase == "initialize")
            .map(|(name, _)| name.as_str())
            .collect();
        let started: Vec<&str> = entries
            .iter()
            .filter(|(_, phase)| *phase == "start")
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(initialized.len(), count, "seed {seed}");
        assert_eq!(started, initialized, "seed {seed}");
        assert!(
            entries[..count].iter().all(|(_, phase)| *phase == "initialize"),
            "seed {seed}: start ran before every initialize"
        );

        for (module, dependencies) in &requirements {
            let at = initialized
                .iter()
                .position(|name| *name == module.as_str())
                .expect("module initialized");
            for dependency in dependencies {
                let provider_at = initialized
                    .iter()
                    .position(|name| *name == dependency.as_str())
                    .expect("provider initialized");
                assert!(provider_at < at, "seed {seed}: {dependency} after {module}");
            }
        }
    }
}

#[test]
fn shutdown_reverses_initialization_order() {
    for seed in 0..16 {
        let journal = Journal::default();
        let (extensions, _) = acyclic_set(seed, &journal);
        let mut booted = ExtensionLoader::new()
            .boot(&mut context(), extensions)
            .expect("acyclic set must boot");
        let order: Vec<String> = booted.iter().map(|c| c.name().to_string()).collect();
        journal.lock().expect("journal lock").clear();

        let failures = connector_core::system::loader::shutdown_extensions(
            &mut booted,
            &LogMonitor,
            LifecycleLimits::default(),
        );
        assert!(failures.is_empty());

        let stopped: Vec<String> = journal
            .lock()
            .expect("journal lock")
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        let mut expected = order.clone();
        expected.reverse();
        assert_eq!(stopped, expected, "seed {seed}");
    }
}

#[test]
fn boot_output_is_reproducible() {
    let first = {
        let journal = Journal::default();
        let (extensions, _) = acyclic_set(7, &journal);
        let booted = ExtensionLoader::new()
            .boot(&mut context(), extensions)
            .expect("boot");
        booted.iter().map(|c| c.name().to_string()).collect::<Vec<_>>()
    };
    let second = {
        let journal = Journal::default();
        let (extensions, _) = acyclic_set(7, &journal);
        let booted = ExtensionLoader::new()
            .boot(&mut context(), extensions)
            .expect("boot");
        booted.iter().map(|c| c.name().to_string()).collect::<Vec<_>>()
    };
    assert_eq!(first, second);
}

#[test]
fn three_module_cycle_is_reported_without_side_effects() {
    let journal = Journal::default();
    let node = |name: &str, provides: &str, requires: &str| Node {
        name: name.to_string(),
        provides: vec![CapabilityId::from(provides.to_string())],
        requires: vec![Requirement::required(CapabilityId::from(requires.to_string()))],
        journal: journal.clone(),
    };
    let extensions = vec![
        InjectionContainer::new(Box::new(node("a", "test:a", "test:c"))),
        InjectionContainer::new(Box::new(node("b", "test:b", "test:a"))),
        InjectionContainer::new(Box::new(node("c", "test:c", "test:b"))),
    ];

    let err = ExtensionLoader::new()
        .boot(&mut context(), extensions)
        .expect_err("cycle must fail");

    match err {
        BootError::CyclicDependency { cycle } => {
            assert_eq!(cycle.len(), 3);
            assert!(cycle.contains(&"a".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(journal.lock().expect("journal lock").is_empty());
}
