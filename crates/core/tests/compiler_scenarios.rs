use std::path::Path;

use chrono::Utc;
use dreamfactory_core::capabilities::{Capabilities, ModelInfo};
use dreamfactory_core::compiler::{compile, CompileContext, CompiledQueue};
use dreamfactory_core::job::{JobSpec, NumberRange, PromptMode};
use dreamfactory_core::record::{write_record, GenerationRecord};
use dreamfactory_core::sweep::SweepOverrides;
use dreamfactory_core::template::PromptTemplate;
use dreamfactory_core::wildcards::WildcardTable;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn run(contents: &str, caps: &Capabilities, seed: u64) -> CompiledQueue {
    let template = PromptTemplate::parse(contents);
    let defaults = JobSpec::default();
    let table = WildcardTable::new();
    let ctx = CompileContext {
        template: &template,
        defaults: &defaults,
        capabilities: caps,
        wildcards: &table,
        overrides: SweepOverrides::default(),
        loop_index: 0,
        seed_offset: 0,
        queue_depth: 10,
    };
    compile(&ctx, &mut StdRng::seed_from_u64(seed))
}

fn touch(path: &Path) {
    std::fs::write(path, b"not really a png").unwrap();
}

#[test]
fn two_fixed_sections_give_their_product() {
    let q = run(
        "[prompts 1]\ncat\ndog\nowl\n[prompts 1]\nred\ngreen\nblue\nwhite\n",
        &Capabilities::default(),
        1,
    );
    assert_eq!(q.jobs.len(), 12);
    assert!(q.warnings.is_empty());
}

#[test]
fn scale_range_survives_compilation() {
    let q = run(
        "[config]\n!MODE = standard\n!SCALE = 5-9\n[prompts 1]\ncat\ndog\n",
        &Capabilities::default(),
        1,
    );
    assert_eq!(q.jobs.len(), 2);

    let mut rng = StdRng::seed_from_u64(42);
    for job in &q.jobs {
        assert_eq!(job.scale, NumberRange { min: 5.0, max: 9.0 });
        let mut dispatched = job.clone();
        dispatched.resolve_late(&mut rng);
        let scale = dispatched.scale.value();
        assert!((5.0..=9.0).contains(&scale));
    }
}

#[test]
fn process_mode_rejects_anything_but_go() {
    let q = run(
        "[config]\n!MODE = process\n[prompts]\nstop\n",
        &Capabilities::default(),
        1,
    );
    assert_eq!(q.control.mode, PromptMode::Process);
    assert!(q.jobs.is_empty());
    assert_eq!(q.warnings.len(), 1);
}

#[test]
fn ranged_pick_counts_vary_but_stay_in_bounds() {
    for seed in 0..8 {
        let q = run(
            "[prompts 1-2 \", \"]\nred\nblue\ngreen\n[prompts]\ncar\n",
            &Capabilities::default(),
            seed,
        );
        // k = 1 gives 3 draws, k = 2 gives 3 draws.
        assert_eq!(q.jobs.len(), 3);
        for job in &q.jobs {
            assert!(job.prompt.ends_with(" car"));
        }
    }
}

#[test]
fn random_picks_keep_draw_order() {
    let mut seen = std::collections::HashSet::new();
    for seed in 0..10 {
        let q = run(
            "[config]\n!MODE = random\n[prompts 2]\nred\nblue\n",
            &Capabilities::default(),
            seed,
        );
        assert_eq!(q.jobs.len(), 10);
        seen.extend(q.jobs.into_iter().map(|j| j.prompt));
    }
    assert!(seen.contains("red blue"), "{seen:?}");
    assert!(seen.contains("blue red"), "{seen:?}");
}

#[test]
fn input_and_reference_directories_cross_product() {
    let inputs = tempfile::tempdir().unwrap();
    let refs = tempfile::tempdir().unwrap();
    touch(&inputs.path().join("a.png"));
    touch(&inputs.path().join("b.jpg"));
    touch(&inputs.path().join("notes.txt"));
    touch(&refs.path().join("pose1.png"));
    touch(&refs.path().join("pose2.png"));
    touch(&refs.path().join("pose3.png"));

    let contents = format!(
        "[config]\nINPUT_IMAGE = {}\nCONTROLNET_INPUT_IMAGE = {}\n[prompts]\ncat\ndog\n",
        inputs.path().display(),
        refs.path().display()
    );
    let q = run(&contents, &Capabilities::default(), 1);
    assert_eq!(q.jobs.len(), 2 * 2 * 3);
    assert!(q.jobs.iter().all(|j| j.input_image.as_ref().unwrap().is_file()));
    assert_eq!(
        q.jobs[0].controlnet.input_image.as_deref(),
        Some(refs.path().join("pose1.png").as_path())
    );
}

#[test]
fn checkpoint_list_becomes_sweep() {
    let caps = Capabilities {
        models: ["alpha.safetensors [aa]", "beta.safetensors [bb]"]
            .iter()
            .map(|t| ModelInfo {
                title: t.to_string(),
                filename: None,
            })
            .collect(),
        samplers: vec!["Euler a".into()],
        ..Default::default()
    };
    let q = run("[config]\nCKPT_FILE = all\n[prompts]\ncat\n", &caps, 1);
    assert_eq!(
        q.control.model_sweep,
        vec!["alpha.safetensors [aa]", "beta.safetensors [bb]"]
    );
    assert_eq!(q.jobs[0].ckpt_file.as_deref(), Some("alpha.safetensors [aa]"));
}

#[test]
fn process_mode_sorts_by_recorded_model_for_sd_upscale() {
    let dir = tempfile::tempdir().unwrap();
    for (name, model) in [("1.png", "zeta"), ("2.png", "alpha"), ("3.png", "zeta")] {
        let image = dir.path().join(name);
        touch(&image);
        write_record(
            &image,
            &GenerationRecord {
                prompt: format!("prompt {name}"),
                model: Some(model.to_string()),
                seed: 7,
                created_at: Utc::now(),
                ..Default::default()
            },
        )
        .unwrap();
    }
    touch(&dir.path().join("4.png"));

    let contents = format!(
        "[config]\nMODE = process\nINPUT_IMAGE = {}\nUSE_UPSCALE = yes\nUPSCALE_MODEL = sd\n[prompts]\ngo\n",
        dir.path().display()
    );
    let q = run(&contents, &Capabilities::default(), 1);

    let models: Vec<Option<&str>> = q.jobs.iter().map(|j| j.ckpt_file.as_deref()).collect();
    assert_eq!(models, vec![Some("alpha"), Some("zeta"), Some("zeta"), None]);
    assert_eq!(q.jobs[0].prompt, "prompt 2.png");
    assert_eq!(q.jobs[0].seed, 7);
    assert!(q.jobs.iter().all(|j| !j.renders_primary()));
}
