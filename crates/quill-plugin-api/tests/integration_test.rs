//! Registry-level tests: install, capability isolation, fault
//! containment, handle lifetime, lifecycle hooks, and export dispatch.

use quill_plugin_api::{DisableReason, DocumentHost, ExtensionRegistry, FaultPolicy, RegistryEvent};
use quill_runtime::bytecode::{Bytecode, BytecodeMetadata, Constant, Function, Instruction};
use quill_runtime::{RuntimeError, RuntimeResult, Value, Version};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Default)]
struct MockHost {
    title: String,
    chapters: Vec<(String, String)>,
    files: BTreeMap<String, String>,
}

impl DocumentHost for MockHost {
    fn title(&self) -> RuntimeResult<String> {
        Ok(self.title.clone())
    }
    fn set_title(&mut self, title: &str) -> RuntimeResult<()> {
        self.title = title.to_string();
        Ok(())
    }
    fn chapter_count(&self) -> RuntimeResult<u32> {
        Ok(self.chapters.len() as u32)
    }
    fn chapter_title(&self, index: u32) -> RuntimeResult<String> {
        self.chapters
            .get(index as usize)
            .map(|(t, _)| t.clone())
            .ok_or_else(|| RuntimeError::ExecutionFault("no such chapter".to_string()))
    }
    fn chapter_text(&self, index: u32) -> RuntimeResult<String> {
        self.chapters
            .get(index as usize)
            .map(|(_, t)| t.clone())
            .ok_or_else(|| RuntimeError::ExecutionFault("no such chapter".to_string()))
    }
    fn set_chapter_text(&mut self, index: u32, text: &str) -> RuntimeResult<()> {
        match self.chapters.get_mut(index as usize) {
            Some(chapter) => {
                chapter.1 = text.to_string();
                Ok(())
            }
            None => Err(RuntimeError::ExecutionFault("no such chapter".to_string())),
        }
    }
    fn add_chapter(&mut self, title: &str) -> RuntimeResult<u32> {
        self.chapters.push((title.to_string(), String::new()));
        Ok(self.chapters.len() as u32 - 1)
    }
    fn read_text_file(&self, path: &str) -> RuntimeResult<String> {
        Ok(self.files.get(path).cloned().unwrap_or_default())
    }
    fn write_text_file(&mut self, path: &str, contents: &str) -> RuntimeResult<()> {
        self.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }
    fn http_get(&mut self, _url: &str) -> RuntimeResult<String> {
        Ok("response".to_string())
    }
}

fn test_bytecode(id: &str) -> Bytecode {
    Bytecode {
        version: 1,
        metadata: BytecodeMetadata {
            extension_id: id.to_string(),
            extension_version: "0.1.0".to_string(),
            compiled_at: None,
            compiler_version: None,
        },
        constants: vec![
            Constant::String("markdown".to_string()),
            Constant::String("export_md".to_string()),
            Constant::String("Hacked".to_string()),
            Constant::Int(0),
        ],
        functions: vec![
            Function {
                name: "main".to_string(),
                params: vec![],
                instructions: vec![Instruction::Return],
                local_count: 0,
            },
            Function {
                name: "on_load".to_string(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 0 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::CallHost {
                        name: "export.register".to_string(),
                        arg_count: 2,
                    },
                    Instruction::Return,
                ],
                local_count: 0,
            },
            Function {
                name: "export_md".to_string(),
                params: vec![],
                instructions: vec![
                    Instruction::CallHost {
                        name: "document.get_title".to_string(),
                        arg_count: 0,
                    },
                    Instruction::Return,
                ],
                local_count: 0,
            },
            Function {
                name: "read_title".to_string(),
                params: vec![],
                instructions: vec![
                    Instruction::CallHost {
                        name: "document.get_title".to_string(),
                        arg_count: 0,
                    },
                    Instruction::Return,
                ],
                local_count: 0,
            },
            Function {
                name: "write_title".to_string(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 2 },
                    Instruction::CallHost {
                        name: "document.set_title".to_string(),
                        arg_count: 1,
                    },
                    Instruction::Return,
                ],
                local_count: 0,
            },
            Function {
                name: "grab".to_string(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 3 },
                    Instruction::CallHost {
                        name: "document.get_chapter".to_string(),
                        arg_count: 1,
                    },
                    Instruction::Return,
                ],
                local_count: 0,
            },
            Function {
                name: "use_handle".to_string(),
                params: vec!["h".to_string()],
                instructions: vec![
                    Instruction::LoadLocal { index: 0 },
                    Instruction::CallHost {
                        name: "chapter.get_title".to_string(),
                        arg_count: 1,
                    },
                    Instruction::Return,
                ],
                local_count: 0,
            },
            Function {
                name: "crash".to_string(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 3 },
                    Instruction::LoadConst { index: 3 },
                    Instruction::Div,
                    Instruction::Return,
                ],
                local_count: 0,
            },
        ],
        entry_point: "main".to_string(),
    }
}

fn write_extension_from(
    root: &Path,
    dir_name: &str,
    id: &str,
    api_version: &str,
    caps: &[&str],
    deps: &[(&str, &str)],
    bytecode: &Bytecode,
) -> PathBuf {
    let dir = root.join(dir_name);
    std::fs::create_dir_all(&dir).unwrap();

    let caps_toml: Vec<String> = caps.iter().map(|c| format!("\"{c}\"")).collect();
    let mut manifest = format!(
        r#"
capabilities = [{}]

[extension]
id = "{id}"
display_name = "Test Extension"
version = "0.2.0"
api_version = "{api_version}"
"#,
        caps_toml.join(", ")
    );
    for (dep_id, min) in deps {
        manifest.push_str(&format!(
            "\n[[dependencies]]\nid = \"{dep_id}\"\nmin_version = \"{min}\"\n"
        ));
    }
    std::fs::write(dir.join("manifest.toml"), manifest).unwrap();
    std::fs::write(
        dir.join("extension.qlb"),
        serde_json::to_vec(bytecode).unwrap(),
    )
    .unwrap();
    dir
}

fn write_extension(
    root: &Path,
    dir_name: &str,
    id: &str,
    api_version: &str,
    caps: &[&str],
    deps: &[(&str, &str)],
) -> PathBuf {
    // on_load registers an export hook; only ship it when the extension
    // actually holds the capability, or every install would fail.
    let mut bytecode = test_bytecode(id);
    if !caps.contains(&"export.register") {
        bytecode.functions.retain(|f| f.name != "on_load");
    }
    write_extension_from(root, dir_name, id, api_version, caps, deps, &bytecode)
}

fn registry(staging: &Path) -> ExtensionRegistry {
    ExtensionRegistry::new(Version::new(1, 2, 0), staging)
}

#[test]
fn test_install_runs_load_hook() {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_extension(
        dir.path(),
        "ext",
        "org.example.md",
        "1.2.0",
        &["document.read", "export.register"],
        &[],
    );
    let mut host = MockHost {
        title: "Draft".to_string(),
        ..Default::default()
    };
    let mut reg = registry(&dir.path().join("staging"));

    let id = reg.install(&ext, &mut host).unwrap();
    assert_eq!(id, "org.example.md");
    assert!(reg.is_enabled(&id));
    // on_load registered the markdown exporter.
    assert_eq!(reg.export_formats(), vec!["markdown".to_string()]);

    let title = reg.call(&id, "read_title", vec![], &mut host).unwrap();
    assert_eq!(title, Value::Str("Draft".to_string()));
}

#[test]
fn test_capability_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_extension(
        dir.path(),
        "ext",
        "org.example.reader",
        "1.2.0",
        &["document.read"],
        &[],
    );
    let mut host = MockHost {
        title: "Original".to_string(),
        ..Default::default()
    };
    let mut reg = registry(&dir.path().join("staging"));
    let id = reg.install(&ext, &mut host).unwrap();

    let result = reg.call(&id, "write_title", vec![], &mut host);
    assert!(matches!(
        result,
        Err(RuntimeError::CapabilityDenied { .. })
    ));
    // The denied write never touched the document.
    assert_eq!(host.title, "Original");
    // Denials are not faults; the extension stays enabled.
    assert!(reg.is_enabled(&id));
    assert_eq!(reg.get(&id).unwrap().faults.recent_count(), 0);
}

#[test]
fn test_circuit_breaker_disables_faulting_extension() {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_extension(
        dir.path(),
        "ext",
        "org.example.crashy",
        "1.2.0",
        &[],
        &[],
    );
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging")).with_fault_policy(FaultPolicy {
        max_faults: 3,
        window: Duration::from_secs(60),
    });
    let id = reg.install(&ext, &mut host).unwrap();
    let mut events = reg.subscribe();

    for _ in 0..2 {
        assert!(matches!(
            reg.call(&id, "crash", vec![], &mut host),
            Err(RuntimeError::ExecutionFault(_))
        ));
        assert!(reg.is_enabled(&id));
    }
    // Third fault trips the breaker.
    assert!(reg.call(&id, "crash", vec![], &mut host).is_err());
    assert!(!reg.is_enabled(&id));
    assert!(matches!(
        reg.call(&id, "main", vec![], &mut host),
        Err(RuntimeError::ExtensionDisabled(_))
    ));

    let mut saw_breaker = false;
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::Disabled {
            reason: DisableReason::CircuitBreaker,
            ..
        } = event
        {
            saw_breaker = true;
        }
    }
    assert!(saw_breaker);
}

#[test]
fn test_stale_handle_rejected_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_extension(
        dir.path(),
        "ext",
        "org.example.handles",
        "1.2.0",
        &["document.read"],
        &[],
    );
    let mut host = MockHost::default();
    host.chapters.push(("One".to_string(), String::new()));
    let mut reg = registry(&dir.path().join("staging"));

    let id = reg.install(&ext, &mut host).unwrap();
    let handle = reg.call(&id, "grab", vec![], &mut host).unwrap();
    assert!(matches!(handle, Value::Handle(_)));

    // Same session: the handle resolves.
    let title = reg
        .call(&id, "use_handle", vec![handle.clone()], &mut host)
        .unwrap();
    assert_eq!(title, Value::Str("One".to_string()));

    // Reinstall; the old session's handle must never resolve again.
    reg.uninstall(&id, &mut host).unwrap();
    let id = reg.install(&ext, &mut host).unwrap();
    let result = reg.call(&id, "use_handle", vec![handle], &mut host);
    assert!(matches!(result, Err(RuntimeError::SessionClosed)));
}

#[test]
fn test_disable_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_extension(
        dir.path(),
        "ext",
        "org.example.toggle",
        "1.2.0",
        &[],
        &[],
    );
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging"));
    let id = reg.install(&ext, &mut host).unwrap();

    reg.disable(&id, &mut host).unwrap();
    reg.disable(&id, &mut host).unwrap();
    assert!(!reg.is_enabled(&id));
    assert!(matches!(
        reg.call(&id, "main", vec![], &mut host),
        Err(RuntimeError::ExtensionDisabled(_))
    ));

    reg.enable(&id, &mut host).unwrap();
    assert!(reg.is_enabled(&id));
    assert!(reg.call(&id, "main", vec![], &mut host).is_ok());
}

#[test]
fn test_incompatible_api_version_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_extension(
        dir.path(),
        "ext",
        "org.example.future",
        "2.0.0",
        &[],
        &[],
    );
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging"));
    assert!(matches!(
        reg.install(&ext, &mut host),
        Err(RuntimeError::IncompatibleApiVersion { .. })
    ));
    assert_eq!(reg.count(), 0);
}

#[test]
fn test_duplicate_install_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_extension(dir.path(), "ext", "org.example.one", "1.2.0", &[], &[]);
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging"));
    reg.install(&ext, &mut host).unwrap();
    assert!(matches!(
        reg.install(&ext, &mut host),
        Err(RuntimeError::DuplicateId(_))
    ));
}

#[test]
fn test_dependency_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let dep = write_extension(dir.path(), "dep", "org.example.base", "1.2.0", &[], &[]);
    let ext = write_extension(
        dir.path(),
        "ext",
        "org.example.addon",
        "1.2.0",
        &[],
        &[("org.example.base", "0.2.0")],
    );
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging"));

    assert!(matches!(
        reg.install(&ext, &mut host),
        Err(RuntimeError::DependencyUnsatisfied { .. })
    ));

    reg.install(&dep, &mut host).unwrap();
    reg.install(&ext, &mut host).unwrap();
    assert_eq!(reg.count(), 2);
}

#[test]
fn test_uninstall_removes_extension() {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_extension(dir.path(), "ext", "org.example.gone", "1.2.0", &[], &[]);
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging"));
    let id = reg.install(&ext, &mut host).unwrap();

    reg.uninstall(&id, &mut host).unwrap();
    assert!(!reg.contains(&id));
    assert!(matches!(
        reg.call(&id, "main", vec![], &mut host),
        Err(RuntimeError::ExtensionNotFound(_))
    ));
    assert!(matches!(
        reg.uninstall(&id, &mut host),
        Err(RuntimeError::ExtensionNotFound(_))
    ));
}

#[test]
fn test_signature_required_rejects_directory_source() {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_extension(dir.path(), "ext", "org.example.dev", "1.2.0", &[], &[]);
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging")).with_signature_required(true);
    assert!(matches!(
        reg.install(&ext, &mut host),
        Err(RuntimeError::SignatureRejected(_))
    ));
}

#[test]
fn test_export_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_extension(
        dir.path(),
        "ext",
        "org.example.exporter",
        "1.2.0",
        &["document.read", "export.register"],
        &[],
    );
    let mut host = MockHost {
        title: "My Novel".to_string(),
        ..Default::default()
    };
    let mut reg = registry(&dir.path().join("staging"));
    let id = reg.install(&ext, &mut host).unwrap();

    let result = reg.run_export("markdown", vec![], &mut host).unwrap();
    assert_eq!(result, Value::Str("My Novel".to_string()));

    // Disabled extensions drop out of export dispatch.
    reg.disable(&id, &mut host).unwrap();
    assert!(reg.export_formats().is_empty());
    assert!(matches!(
        reg.run_export("markdown", vec![], &mut host),
        Err(RuntimeError::ExtensionNotFound(_))
    ));
}

fn hook_fn(name: &str, instructions: Vec<Instruction>) -> Function {
    Function {
        name: name.to_string(),
        params: vec![],
        instructions,
        local_count: 0,
    }
}

fn add_chapter_body(title_const: usize) -> Vec<Instruction> {
    vec![
        Instruction::LoadConst { index: title_const },
        Instruction::CallHost {
            name: "document.add_chapter".to_string(),
            arg_count: 1,
        },
        Instruction::Return,
    ]
}

fn crash_body() -> Vec<Instruction> {
    vec![
        Instruction::LoadConst { index: 2 },
        Instruction::LoadConst { index: 2 },
        Instruction::Div,
        Instruction::Return,
    ]
}

/// Bytecode whose teardown hooks leave a chapter behind, so a test can
/// read the invocation order back out of the host.
fn lifecycle_bytecode(id: &str) -> Bytecode {
    Bytecode {
        version: 1,
        metadata: BytecodeMetadata {
            extension_id: id.to_string(),
            extension_version: "0.1.0".to_string(),
            compiled_at: None,
            compiler_version: None,
        },
        constants: vec![
            Constant::String("on_disable".to_string()),
            Constant::String("on_unload".to_string()),
            Constant::Int(0),
        ],
        functions: vec![
            hook_fn("main", vec![Instruction::Return]),
            hook_fn("on_disable", add_chapter_body(0)),
            hook_fn("on_unload", add_chapter_body(1)),
        ],
        entry_point: "main".to_string(),
    }
}

fn chapter_titles(host: &MockHost) -> Vec<&str> {
    host.chapters.iter().map(|(t, _)| t.as_str()).collect()
}

#[test]
fn test_uninstall_runs_disable_then_unload() {
    let dir = tempfile::tempdir().unwrap();
    let bc = lifecycle_bytecode("org.example.tidy");
    let ext = write_extension_from(
        dir.path(),
        "ext",
        "org.example.tidy",
        "1.2.0",
        &["document.write"],
        &[],
        &bc,
    );
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging"));
    let id = reg.install(&ext, &mut host).unwrap();

    reg.uninstall(&id, &mut host).unwrap();
    assert_eq!(chapter_titles(&host), vec!["on_disable", "on_unload"]);
    assert!(!reg.contains(&id));
}

#[test]
fn test_faulting_disable_hook_does_not_block_unload() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = lifecycle_bytecode("org.example.stubborn");
    for f in &mut bc.functions {
        if f.name == "on_disable" {
            f.instructions = crash_body();
        }
    }
    let ext = write_extension_from(
        dir.path(),
        "ext",
        "org.example.stubborn",
        "1.2.0",
        &["document.write"],
        &[],
        &bc,
    );
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging"));
    let id = reg.install(&ext, &mut host).unwrap();
    let mut events = reg.subscribe();

    // Teardown is best-effort: the crashing on_disable neither aborts
    // the uninstall nor stops on_unload from running.
    reg.uninstall(&id, &mut host).unwrap();
    assert_eq!(chapter_titles(&host), vec!["on_unload"]);
    assert!(!reg.contains(&id));

    let mut saw_fault = false;
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::Fault { operation, .. } = event {
            if operation == "on_disable" {
                saw_fault = true;
            }
        }
    }
    assert!(saw_fault);
}

#[test]
fn test_disable_hook_fault_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = lifecycle_bytecode("org.example.grumpy");
    for f in &mut bc.functions {
        if f.name == "on_disable" {
            f.instructions = crash_body();
        }
    }
    let ext = write_extension_from(
        dir.path(),
        "ext",
        "org.example.grumpy",
        "1.2.0",
        &["document.write"],
        &[],
        &bc,
    );
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging"));
    let id = reg.install(&ext, &mut host).unwrap();
    let mut events = reg.subscribe();

    // Disable itself still succeeds; the hook fault feeds the tracker.
    reg.disable(&id, &mut host).unwrap();
    assert!(!reg.is_enabled(&id));
    assert_eq!(reg.get(&id).unwrap().faults.recent_count(), 1);

    let mut saw_fault = false;
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::Fault { operation, .. } = event {
            if operation == "on_disable" {
                saw_fault = true;
            }
        }
    }
    assert!(saw_fault);
}

#[test]
fn test_enable_hook_fault_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = lifecycle_bytecode("org.example.flaky");
    bc.functions.retain(|f| f.name == "main");
    // on_enable reads chapter 0: fine at install time, a fault once the
    // document is empty again.
    bc.functions.push(hook_fn(
        "on_enable",
        vec![
            Instruction::LoadConst { index: 2 },
            Instruction::CallHost {
                name: "document.get_chapter".to_string(),
                arg_count: 1,
            },
            Instruction::Return,
        ],
    ));
    let ext = write_extension_from(
        dir.path(),
        "ext",
        "org.example.flaky",
        "1.2.0",
        &["document.read"],
        &[],
        &bc,
    );
    let mut host = MockHost::default();
    host.chapters.push(("One".to_string(), String::new()));
    let mut reg = registry(&dir.path().join("staging"));
    let id = reg.install(&ext, &mut host).unwrap();
    let mut events = reg.subscribe();

    host.chapters.clear();
    reg.disable(&id, &mut host).unwrap();
    assert!(matches!(
        reg.enable(&id, &mut host),
        Err(RuntimeError::ExecutionFault(_))
    ));
    // Rolled back to disabled, with the fault on the books.
    assert!(!reg.is_enabled(&id));
    assert_eq!(reg.get(&id).unwrap().faults.recent_count(), 1);

    let mut saw_fault = false;
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::Fault { operation, .. } = event {
            if operation == "on_enable" {
                saw_fault = true;
            }
        }
    }
    assert!(saw_fault);
}

#[test]
fn test_faulting_load_hook_aborts_install() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = lifecycle_bytecode("org.example.broken");
    bc.functions.push(hook_fn("on_load", crash_body()));
    let ext = write_extension_from(
        dir.path(),
        "ext",
        "org.example.broken",
        "1.2.0",
        &["document.write"],
        &[],
        &bc,
    );
    let mut host = MockHost::default();
    let mut reg = registry(&dir.path().join("staging"));
    let mut events = reg.subscribe();

    assert!(matches!(
        reg.install(&ext, &mut host),
        Err(RuntimeError::ExecutionFault(_))
    ));
    // No registry entry survives the aborted install.
    assert_eq!(reg.count(), 0);
    assert!(!reg.contains("org.example.broken"));

    let mut saw_fault = false;
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::Fault { operation, .. } = event {
            if operation == "on_load" {
                saw_fault = true;
            }
        }
    }
    assert!(saw_fault);
}
