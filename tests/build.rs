//! End-to-end build scenarios driven by scripted builders.

use kiln::{
    builder::clear_value_cache, BatchNode, Builder, Entity, KilnError, Node, RawValue, Signature,
    Source, TargetUpdate, VFile,
};
use pretty_assertions::assert_eq;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A scripted compiler: `a.c` becomes `a.o` holding `obj:<input>`. Optionally
/// reports headers as implicit deps and emits a `.map` side effect per object.
struct TestCompiler {
    signature: Vec<u8>,
    headers: Vec<PathBuf>,
    emit_map: bool,
    builds: AtomicUsize,
}

impl TestCompiler {
    fn new(signature: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            signature: signature.to_vec(),
            headers: Vec::new(),
            emit_map: false,
            builds: AtomicUsize::new(0),
        })
    }

    fn with_headers(signature: &[u8], headers: Vec<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            signature: signature.to_vec(),
            headers,
            emit_map: false,
            builds: AtomicUsize::new(0),
        })
    }

    fn with_map(signature: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            signature: signature.to_vec(),
            headers: Vec::new(),
            emit_map: true,
            builds: AtomicUsize::new(0),
        })
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl Builder for TestCompiler {
    fn name(&self) -> &str {
        "cc"
    }

    fn signature(&self) -> Signature {
        Signature::new(self.signature.clone())
    }

    fn build(&self, node: &Node) -> kiln::Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        for source in node.source_values()? {
            let path = source.path().expect("sources are files");
            let content = fs::read(path).map_err(|e| KilnError::io(e, path))?;
            let object = path.with_extension("o");
            fs::write(&object, [b"obj:".as_slice(), &content[..]].concat())
                .map_err(|e| KilnError::io(e, &object))?;

            let mut update = TargetUpdate::targets([RawValue::path(object.clone())]);
            if self.emit_map {
                let map = PathBuf::from(format!("{}.map", object.display()));
                fs::write(&map, b"map").map_err(|e| KilnError::io(e, &map))?;
                update = update.with_side_effects([RawValue::path(map)]);
            }
            if !self.headers.is_empty() {
                update = update
                    .with_implicit_deps(self.headers.iter().map(|h| RawValue::path(h.clone())));
            }
            node.add_targets(update)?;
        }
        Ok(())
    }
}

/// The batch flavor: one object per source, recording which sources were
/// actually processed.
struct BatchCompiler {
    signature: Vec<u8>,
    processed: Mutex<Vec<String>>,
}

impl BatchCompiler {
    fn new(signature: &[u8]) -> Arc<Self> {
        Arc::new(Self { signature: signature.to_vec(), processed: Mutex::new(Vec::new()) })
    }

    fn processed(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }
}

impl Builder for BatchCompiler {
    fn name(&self) -> &str {
        "cc-batch"
    }

    fn signature(&self) -> Signature {
        Signature::new(self.signature.clone())
    }

    fn build(&self, _node: &Node) -> kiln::Result<()> {
        unreachable!("batch builder is only used with batch nodes")
    }

    fn build_batch(&self, node: &BatchNode) -> kiln::Result<()> {
        for source in node.changed_source_values()? {
            let path = source.path().expect("sources are files").to_path_buf();
            self.processed.lock().unwrap().push(
                path.file_name().unwrap().to_string_lossy().into_owned(),
            );
            let content = fs::read(&path).map_err(|e| KilnError::io(e, &path))?;
            let object = path.with_extension("o");
            fs::write(&object, [b"obj:".as_slice(), &content[..]].concat())
                .map_err(|e| KilnError::io(e, &object))?;
            node.add_source_targets(
                &source,
                TargetUpdate::targets([RawValue::path(object)]),
            )?;
        }
        Ok(())
    }
}

/// Produces two blobs, one public and one private, from its source file.
struct TaggedGenerator {
    private_payload: String,
}

impl Builder for TaggedGenerator {
    fn name(&self) -> &str {
        "gen"
    }

    fn signature(&self) -> Signature {
        Signature::new(b"gen-v1".to_vec())
    }

    fn build(&self, node: &Node) -> kiln::Result<()> {
        node.add_targets(TargetUpdate::targets(["public-payload"]).with_tags(["public"]))?;
        node.add_targets(
            TargetUpdate::targets([self.private_payload.as_str()]).with_tags(["private"]),
        )?;
        Ok(())
    }
}

fn vfile(dir: &Path) -> VFile {
    VFile::open(dir.join(".cache").join("values.json")).unwrap()
}

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn fresh_build_then_cache_hit() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    write(dir.path(), "a.c", "int a=1;");

    let compiler = TestCompiler::new(b"v1");
    let node = Node::with_cwd(compiler.clone(), [Source::path("a.c")], dir.path());

    assert!(!node.is_actual(&mut vfile, None).unwrap());
    node.build().unwrap();
    node.save(&mut vfile).unwrap();
    assert_eq!(compiler.builds(), 1);

    let targets = node.target_values().unwrap();
    assert_eq!(targets.len(), 1);
    let expected = kiln::utils::normalize_path("a.o", Some(dir.path())).unwrap();
    assert_eq!(targets[0].name(), expected.to_string_lossy().into_owned());
    assert_eq!(fs::read(&expected).unwrap(), b"obj:int a=1;");

    assert!(node.is_actual(&mut vfile, None).unwrap());
    assert_eq!(compiler.builds(), 1);
}

#[test]
fn unchanged_source_skips_the_builder() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    write(dir.path(), "a.c", "int a=1;");

    let first = TestCompiler::new(b"v1");
    let node = Node::with_cwd(first.clone(), [Source::path("a.c")], dir.path());
    assert!(!node.is_actual(&mut vfile, None).unwrap());
    node.build().unwrap();
    node.save(&mut vfile).unwrap();

    // a second run constructs everything from scratch
    clear_value_cache();
    let second = TestCompiler::new(b"v1");
    let rerun = Node::with_cwd(second.clone(), [Source::path("a.c")], dir.path());
    assert!(rerun.is_actual(&mut vfile, None).unwrap());
    assert_eq!(second.builds(), 0);
    assert_eq!(rerun.target_values().unwrap(), node.target_values().unwrap());
}

#[test]
fn changed_builder_signature_forces_rebuild() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    write(dir.path(), "a.c", "int a=1;");

    let node =
        Node::with_cwd(TestCompiler::new(b"v1"), [Source::path("a.c")], dir.path());
    assert!(!node.is_actual(&mut vfile, None).unwrap());
    node.build().unwrap();
    node.save(&mut vfile).unwrap();

    clear_value_cache();
    let upgraded =
        Node::with_cwd(TestCompiler::new(b"v2"), [Source::path("a.c")], dir.path());
    assert!(!upgraded.is_actual(&mut vfile, None).unwrap());
}

#[test]
fn changed_implicit_dep_invalidates_and_repairs() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    write(dir.path(), "a.c", "#include \"a.h\"\n");
    let header = write(dir.path(), "a.h", "#define A 1");

    let compiler = TestCompiler::with_headers(b"v1", vec![header.clone()]);
    let node = Node::with_cwd(compiler, [Source::path("a.c")], dir.path());
    assert!(!node.is_actual(&mut vfile, None).unwrap());
    node.build().unwrap();
    node.save(&mut vfile).unwrap();
    assert!(node.is_actual(&mut vfile, None).unwrap());

    // the header changes; the source file does not
    fs::write(&header, "#define A 2").unwrap();
    clear_value_cache();

    let compiler = TestCompiler::with_headers(b"v1", vec![header.clone()]);
    let rerun = Node::with_cwd(compiler.clone(), [Source::path("a.c")], dir.path());
    assert!(!rerun.is_actual(&mut vfile, None).unwrap());

    // the stale dep record was repaired in place while checking
    let probe = Entity::file_checksum(&header).unwrap();
    let stored = vfile.find(&probe).unwrap().unwrap();
    assert_eq!(stored.signature(), probe.signature());

    rerun.build().unwrap();
    rerun.save(&mut vfile).unwrap();
    assert_eq!(compiler.builds(), 1);
    assert!(rerun.is_actual(&mut vfile, None).unwrap());
}

#[test]
fn missing_side_effect_target_is_stale() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    write(dir.path(), "a.c", "int a=1;");

    let node = Node::with_cwd(TestCompiler::with_map(b"v1"), [Source::path("a.c")], dir.path());
    assert!(!node.is_actual(&mut vfile, None).unwrap());
    node.build().unwrap();
    node.save(&mut vfile).unwrap();

    let map = dir.path().join("a.o.map");
    assert!(map.exists());
    fs::remove_file(&map).unwrap();

    clear_value_cache();
    let compiler = TestCompiler::with_map(b"v1");
    let rerun = Node::with_cwd(compiler.clone(), [Source::path("a.c")], dir.path());
    assert!(!rerun.is_actual(&mut vfile, None).unwrap());
    rerun.build().unwrap();
    rerun.save(&mut vfile).unwrap();
    assert_eq!(compiler.builds(), 1);
    assert!(map.exists());
    assert!(dir.path().join("a.o").exists());
}

#[test]
fn batch_rebuilds_only_changed_sources() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    for name in ["x.c", "y.c", "z.c"] {
        write(dir.path(), name, &format!("// {name}\n"));
    }
    let sources = || [Source::path("x.c"), Source::path("y.c"), Source::path("z.c")];

    let compiler = BatchCompiler::new(b"v1");
    let node = BatchNode::with_cwd(compiler.clone(), sources(), dir.path());
    assert!(!node.is_actual(&mut vfile, None).unwrap());
    node.build().unwrap();
    node.save(&mut vfile).unwrap();
    assert_eq!(compiler.processed(), vec!["x.c", "y.c", "z.c"]);
    assert_eq!(node.target_values().unwrap().len(), 3);

    // only y.c changes
    write(dir.path(), "y.c", "// y.c changed\n");
    clear_value_cache();

    let compiler = BatchCompiler::new(b"v1");
    let rerun = BatchNode::with_cwd(compiler.clone(), sources(), dir.path());
    assert!(!rerun.is_actual(&mut vfile, None).unwrap());
    let changed: Vec<String> = rerun
        .changed_source_values()
        .unwrap()
        .iter()
        .map(|s| s.path().unwrap().file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(changed, vec!["y.c"]);

    rerun.build().unwrap();
    rerun.save(&mut vfile).unwrap();
    assert_eq!(compiler.processed(), vec!["y.c"]);

    let objects: Vec<String> = rerun
        .target_values()
        .unwrap()
        .iter()
        .map(|t| t.path().unwrap().file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(objects, vec!["x.o", "y.o", "z.o"]);

    // a third run sees everything cached
    clear_value_cache();
    let compiler = BatchCompiler::new(b"v1");
    let cached = BatchNode::with_cwd(compiler.clone(), sources(), dir.path());
    assert!(cached.is_actual(&mut vfile, None).unwrap());
    assert!(compiler.processed().is_empty());
    assert_eq!(cached.target_values().unwrap().len(), 3);
}

#[test]
fn tag_filter_selects_sources_and_shields_signature() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "b.c", "int b;");

    let build_generator = |private_payload: &str| {
        let generator = Arc::new(TaggedGenerator { private_payload: private_payload.into() });
        let node = Arc::new(Node::with_cwd(generator, [] as [Source; 0], dir.path()));
        node.build().unwrap();
        node
    };

    let generator = build_generator("private-1");
    let consumer = Node::with_cwd(
        TestCompiler::new(b"v1"),
        [Source::from(generator.at(["public"])), Source::path("b.c")],
        dir.path(),
    );

    let resolved = consumer.source_values().unwrap();
    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved[0].data().unwrap(), b"public-payload");
    assert_eq!(
        resolved[0].tags().map(|t| t.iter().cloned().collect::<Vec<_>>()),
        Some(vec!["public".to_string()])
    );

    // the private target does not contribute to the consumer's fingerprint
    let generator_changed_private = build_generator("private-2");
    let consumer_again = Node::with_cwd(
        TestCompiler::new(b"v1"),
        [Source::from(generator_changed_private.at(["public"])), Source::path("b.c")],
        dir.path(),
    );
    assert_eq!(consumer.signature().unwrap(), consumer_again.signature().unwrap());
}

#[test]
fn node_with_empty_target_list_is_built() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    write(dir.path(), "a.c", "int a;");

    struct Validator;
    impl Builder for Validator {
        fn name(&self) -> &str {
            "validate"
        }
        fn signature(&self) -> Signature {
            Signature::new(b"validate-v1".to_vec())
        }
        fn build(&self, node: &Node) -> kiln::Result<()> {
            node.set_no_targets();
            Ok(())
        }
    }

    let node = Node::with_cwd(Arc::new(Validator), [Source::path("a.c")], dir.path());
    assert!(!node.is_actual(&mut vfile, None).unwrap());
    node.build().unwrap();
    node.save(&mut vfile).unwrap();

    let rerun = Node::with_cwd(Arc::new(Validator), [Source::path("a.c")], dir.path());
    assert!(rerun.is_actual(&mut vfile, None).unwrap());
    assert_eq!(rerun.target_values().unwrap(), vec![]);
}

#[test]
fn clear_adopts_and_drops_the_cached_result() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    write(dir.path(), "a.c", "int a;");

    let node = Node::with_cwd(TestCompiler::new(b"v1"), [Source::path("a.c")], dir.path());
    node.build().unwrap();
    node.save(&mut vfile).unwrap();

    clear_value_cache();
    let fresh = Node::with_cwd(TestCompiler::new(b"v1"), [Source::path("a.c")], dir.path());
    fresh.clear(&mut vfile).unwrap();
    fresh.remove_targets().unwrap();
    assert!(!dir.path().join("a.o").exists());
    assert!(!fresh.is_actual(&mut vfile, None).unwrap());
}

#[test]
fn built_set_tightens_actuality() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    write(dir.path(), "a.c", "int a;");

    let node = Node::with_cwd(TestCompiler::new(b"v1"), [Source::path("a.c")], dir.path());
    node.build().unwrap();
    node.save(&mut vfile).unwrap();

    let everything: std::collections::HashSet<Signature> =
        [node.name().unwrap()].into_iter().collect();
    assert!(node.is_actual(&mut vfile, Some(&everything)).unwrap());

    let nothing = std::collections::HashSet::new();
    assert!(!node.is_actual(&mut vfile, Some(&nothing)).unwrap());
}

#[test]
fn saving_unactual_targets_is_rejected() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    write(dir.path(), "a.c", "int a;");

    let node = Node::with_cwd(TestCompiler::new(b"v1"), [Source::path("a.c")], dir.path());
    node.build().unwrap();
    fs::remove_file(dir.path().join("a.o")).unwrap();

    // checked builds refuse to persist a result that already disagrees with
    // the disk
    assert!(matches!(node.save(&mut vfile), Err(KilnError::UnactualValue(_))));
}

#[test]
fn downstream_node_consumes_upstream_targets() {
    init_tracing();
    clear_value_cache();
    let dir = tempfile::tempdir().unwrap();
    let mut vfile = vfile(dir.path());
    write(dir.path(), "a.c", "int a;");

    let compile = Arc::new(Node::with_cwd(
        TestCompiler::new(b"v1"),
        [Source::path("a.c")],
        dir.path(),
    ));
    compile.build().unwrap();
    compile.save(&mut vfile).unwrap();

    struct Archiver;
    impl Builder for Archiver {
        fn name(&self) -> &str {
            "ar"
        }
        fn signature(&self) -> Signature {
            Signature::new(b"ar-v1".to_vec())
        }
        fn build(&self, node: &Node) -> kiln::Result<()> {
            let mut archive = Vec::new();
            for source in node.source_values()? {
                let path = source.path().expect("file source");
                archive.extend(fs::read(path).map_err(|e| KilnError::io(e, path))?);
            }
            let target = node.cwd().join("lib.a");
            fs::write(&target, archive).map_err(|e| KilnError::io(e, &target))?;
            node.add_targets(TargetUpdate::targets([RawValue::path(target)]))?;
            Ok(())
        }
    }

    let archive =
        Node::with_cwd(Arc::new(Archiver), [Source::from(compile.clone())], dir.path());
    assert!(!archive.is_actual(&mut vfile, None).unwrap());
    archive.build().unwrap();
    archive.save(&mut vfile).unwrap();

    assert_eq!(fs::read(dir.path().join("lib.a")).unwrap(), b"obj:int a;");
    assert!(archive.is_actual(&mut vfile, None).unwrap());
}
