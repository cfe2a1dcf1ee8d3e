//! Prompt compiler: turns a parsed template into a concrete job list.
//!
//! A compile pass starts from the base job defaults, applies the template's
//! `[config]` directives, then expands the `[prompts]` sections according
//! to the selected [`PromptMode`]:
//!
//! * standard: the cartesian product of every section's draws,
//! * random: `queue_depth` independent samples,
//! * process: one job per source image for every `go` row.
//!
//! Problems never abort a pass; they are collected into
//! [`CompiledQueue::warnings`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::capabilities::Capabilities;
use crate::directives::{self, Directive, JobTemplate, RunControl};
use crate::images;
use crate::job::{JobSpec, PromptMode};
use crate::record;
use crate::sweep::{seed_for_loop, SweepOverrides};
use crate::template::{PromptSection, PromptTemplate};
use crate::text;
use crate::wildcards::{self, WildcardTable};

/// Process-mode row marker. Matched case-sensitively.
pub const PROCESS_ROW_MARKER: &str = "go";

/// Everything one compile pass reads.
#[derive(Debug, Clone)]
pub struct CompileContext<'a> {
    pub template: &'a PromptTemplate,
    pub defaults: &'a JobSpec,
    pub capabilities: &'a Capabilities,
    pub wildcards: &'a WildcardTable,
    pub overrides: SweepOverrides,
    pub loop_index: u32,
    pub seed_offset: i64,
    /// Number of prompts a random-mode pass produces.
    pub queue_depth: usize,
}

/// Output of one compile pass.
#[derive(Debug, Clone, Default)]
pub struct CompiledQueue {
    pub jobs: Vec<JobSpec>,
    pub warnings: Vec<String>,
    pub control: RunControl,
}

/// Compile `ctx.template` into jobs.
pub fn compile<R: Rng + ?Sized>(ctx: &CompileContext<'_>, rng: &mut R) -> CompiledQueue {
    let mut compiler = Compiler::new(ctx);
    compiler.apply_config();

    match compiler.state.control.mode {
        PromptMode::Standard => compiler.standard(rng),
        PromptMode::Random => compiler.random(rng),
        PromptMode::Process => compiler.process(),
    }

    compiler.finish(rng)
}

struct Compiler<'a, 'c> {
    ctx: &'c CompileContext<'a>,
    state: JobTemplate,
    jobs: Vec<JobSpec>,
    warnings: Vec<String>,
    image_dirs: HashMap<PathBuf, Vec<PathBuf>>,
}

impl<'a, 'c> Compiler<'a, 'c> {
    fn new(ctx: &'c CompileContext<'a>) -> Self {
        let mut state = JobTemplate::new(ctx.defaults.clone());
        state.job.template_path = ctx.template.path.clone();
        Self {
            ctx,
            state,
            jobs: Vec::new(),
            warnings: ctx.template.warnings.clone(),
            image_dirs: HashMap::new(),
        }
    }

    fn apply_config(&mut self) {
        let ctx = self.ctx;
        for line in &ctx.template.config {
            match directives::parse_line(line) {
                Some(directive) => self.apply(&directive),
                None => self
                    .warnings
                    .push(format!("[config] line is not a directive: {line}")),
            }
        }

        let overrides = &ctx.overrides;
        if let Some(model) = &overrides.ckpt_file {
            self.state.job.ckpt_file = Some(model.clone());
        }
        if let Some(model) = &overrides.highres_ckpt_file {
            self.state.job.highres.ckpt_file = Some(model.clone());
        }
    }

    fn apply(&mut self, directive: &Directive) {
        if let Err(e) = directives::apply(
            &mut self.state,
            &directive.key,
            &directive.value,
            self.ctx.capabilities,
        ) {
            self.warnings.push(e.to_string());
        }
    }

    // -- standard ---------------------------------------------------------------

    fn standard<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let ctx = self.ctx;
        let sections = &ctx.template.sections;
        if sections.is_empty() {
            self.warnings
                .push("template has no [prompts] sections; nothing to queue".to_string());
            return;
        }

        let draws: Vec<Vec<Vec<String>>> = sections
            .iter()
            .map(|section| {
                let k = pick_count(section, rng);
                combinations(&section.tokens, k)
            })
            .collect();

        // Odometer over the draws; the last section varies fastest.
        let mut index = vec![0usize; draws.len()];
        loop {
            let combination: Vec<&Vec<String>> = index
                .iter()
                .zip(&draws)
                .map(|(&i, section)| &section[i])
                .collect();
            self.standard_combination(&combination);

            let Some(pos) = (0..index.len())
                .rev()
                .find(|&p| index[p] + 1 < draws[p].len())
            else {
                break;
            };
            index[pos] += 1;
            for later in &mut index[pos + 1..] {
                *later = 0;
            }
        }
    }

    fn standard_combination(&mut self, combination: &[&Vec<String>]) {
        let embedded: Vec<Directive> = combination
            .iter()
            .flat_map(|draw| draw.iter())
            .filter_map(|token| directives::parse_embedded(token))
            .collect();
        if !embedded.is_empty() {
            for directive in &embedded {
                self.apply(directive);
            }
            return;
        }

        let ctx = self.ctx;
        let fragments: Vec<String> = combination
            .iter()
            .zip(&ctx.template.sections)
            .map(|(draw, section)| text::join_fragments(draw.as_slice(), &section.delimiter))
            .collect();
        let prompt = text::clean_prompt(&text::join_fragments(
            &fragments,
            &self.state.control.delimiter,
        ));

        let mut job = self.state.job.clone();
        job.prompt = prompt;
        for job in self.expand_image_dirs(job) {
            self.jobs.push(job);
        }
    }

    /// One job per image when the input or ControlNet reference names a
    /// directory; both directories give the cross product.
    fn expand_image_dirs(&mut self, job: JobSpec) -> Vec<JobSpec> {
        let inputs: Vec<Option<PathBuf>> = match job.input_image.clone().filter(|p| p.is_dir()) {
            Some(dir) => self.dir_images(&dir).into_iter().map(Some).collect(),
            None => vec![job.input_image.clone()],
        };
        let references: Vec<Option<PathBuf>> = match job.controlnet.input_image.clone().filter(|p| p.is_dir()) {
            Some(dir) => self.dir_images(&dir).into_iter().map(Some).collect(),
            None => vec![job.controlnet.input_image.clone()],
        };

        let mut out = Vec::with_capacity(inputs.len() * references.len());
        for input in &inputs {
            for reference in &references {
                let mut expanded = job.clone();
                expanded.input_image = input.clone();
                expanded.controlnet.input_image = reference.clone();
                out.push(expanded);
            }
        }
        out
    }

    fn dir_images(&mut self, dir: &Path) -> Vec<PathBuf> {
        if let Some(cached) = self.image_dirs.get(dir) {
            return cached.clone();
        }
        let found = match images::list_images(dir) {
            Ok(found) => found,
            Err(e) => {
                self.warnings.push(e.to_string());
                Vec::new()
            }
        };
        if found.is_empty() {
            self.warnings
                .push(format!("no images found in {}", dir.display()));
        }
        self.image_dirs.insert(dir.to_path_buf(), found.clone());
        found
    }

    // -- random -----------------------------------------------------------------

    fn random<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let ctx = self.ctx;
        let sections = &ctx.template.sections;
        if sections.is_empty() {
            self.warnings
                .push("template has no [prompts] sections; nothing to queue".to_string());
            return;
        }

        for _ in 0..ctx.queue_depth {
            let mut fragments = Vec::with_capacity(sections.len());
            for section in sections {
                let k = pick_count(section, rng).min(section.tokens.len());
                let picked = rand::seq::index::sample(rng, section.tokens.len(), k).into_vec();

                let mut words = Vec::with_capacity(k);
                for i in picked {
                    let token = &section.tokens[i];
                    match directives::parse_embedded(token) {
                        Some(directive) => self.apply(&directive),
                        None => words.push(token.as_str()),
                    }
                }
                fragments.push(text::join_fragments(&words, &section.delimiter));
            }

            let mut job = self.state.job.clone();
            job.prompt = text::clean_prompt(&text::join_fragments(
                &fragments,
                &self.state.control.delimiter,
            ));
            // A directory input is drawn from at dispatch time.
            if let Some(dir) = job.input_image.clone().filter(|p| p.is_dir()) {
                job.input_image = None;
                job.random_input_image_dir = Some(dir);
            }
            self.jobs.push(job);
        }
    }

    // -- process ----------------------------------------------------------------

    fn process(&mut self) {
        let ctx = self.ctx;
        let Some(section) = ctx.template.sections.first() else {
            self.warnings
                .push("process mode needs a [prompts] section with 'go' rows".to_string());
            return;
        };

        let mut sourced: Vec<(JobSpec, Option<String>)> = Vec::new();
        for token in &section.tokens {
            if let Some(directive) = directives::parse_embedded(token) {
                self.apply(&directive);
                continue;
            }
            if token != PROCESS_ROW_MARKER {
                self.warnings.push(format!(
                    "process mode only accepts '{PROCESS_ROW_MARKER}' rows; '{token}' ignored"
                ));
                continue;
            }
            sourced.extend(self.process_row());
        }

        let sort_by_model = {
            let upscale = &self.state.job.upscale;
            upscale.enabled && upscale.method.is_generative() && upscale.ckpt_file.is_none()
        };
        if sort_by_model {
            sourced.sort_by(|(_, a), (_, b)| match (a, b) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            });
            for (job, model) in &mut sourced {
                if model.is_some() {
                    job.ckpt_file = model.take();
                }
            }
        }

        self.jobs.extend(sourced.into_iter().map(|(job, _)| job));
    }

    /// Jobs for one `go` row, each paired with the model its source image
    /// was rendered with (when a sidecar records one).
    fn process_row(&mut self) -> Vec<(JobSpec, Option<String>)> {
        let Some(input) = self.state.job.input_image.clone() else {
            self.warnings
                .push("'go' row without INPUT_IMAGE; set it to an image or directory".to_string());
            return Vec::new();
        };

        let sources = if input.is_dir() {
            self.dir_images(&input)
        } else if input.is_file() {
            vec![input]
        } else {
            self.warnings
                .push(format!("input image not found: {}", input.display()));
            return Vec::new();
        };

        sources
            .into_iter()
            .map(|source| {
                let mut job = self.state.job.clone();
                let mut model = None;
                if let Ok(rec) = record::read_record(&source) {
                    job.prompt = rec.prompt.clone();
                    job.negative_prompt = rec.negative_prompt.clone();
                    job.seed = rec.seed;
                    model = rec.model_name();
                }
                job.input_image = Some(source);
                (job, model)
            })
            .collect()
    }

    // -- finish -----------------------------------------------------------------

    fn finish<R: Rng + ?Sized>(mut self, rng: &mut R) -> CompiledQueue {
        let process = self.state.control.mode == PromptMode::Process;
        for (i, job) in self.jobs.iter_mut().enumerate() {
            expand_job_text(job, self.ctx.wildcards, rng);
            if !process {
                job.seed = seed_for_loop(job.seed, self.ctx.seed_offset);
            }
            job.sequence = i + 1;
            job.loop_index = self.ctx.loop_index;
        }

        CompiledQueue {
            jobs: self.jobs,
            warnings: self.warnings,
            control: self.state.control,
        }
    }
}

/// Wildcards first (all text fields in lock-step), then the reserved
/// metadata placeholders.
fn expand_job_text<R: Rng + ?Sized>(job: &mut JobSpec, table: &WildcardTable, rng: &mut R) {
    let mut highres_prompt = job.highres.prompt.take();
    let mut highres_negative = job.highres.negative_prompt.take();
    {
        let mut fields: Vec<&mut String> = vec![
            &mut job.iptc.title,
            &mut job.iptc.description,
            &mut job.iptc.keywords,
            &mut job.iptc.copyright,
            &mut job.prompt,
            &mut job.negative_prompt,
        ];
        fields.extend(highres_prompt.as_mut());
        fields.extend(highres_negative.as_mut());
        wildcards::expand_fields(&mut fields, table, rng);
    }

    let iptc = job.iptc.clone();
    job.prompt = wildcards::substitute_reserved(&job.prompt, &iptc);
    job.negative_prompt = wildcards::substitute_reserved(&job.negative_prompt, &iptc);
    job.highres.prompt = highres_prompt.map(|p| wildcards::substitute_reserved(&p, &iptc));
    job.highres.negative_prompt =
        highres_negative.map(|p| wildcards::substitute_reserved(&p, &iptc));
}

fn pick_count<R: Rng + ?Sized>(section: &PromptSection, rng: &mut R) -> usize {
    if section.is_fixed_pick() {
        section.min_pick
    } else {
        rng.random_range(section.min_pick..=section.max_pick)
    }
}

/// Every `k`-combination of `tokens`, in order.
///
/// `k == 0` yields one empty draw; `k >= tokens.len()` yields one draw of
/// all tokens.
pub fn combinations(tokens: &[String], k: usize) -> Vec<Vec<String>> {
    let n = tokens.len();
    if k == 0 {
        return vec![Vec::new()];
    }
    if k >= n {
        return vec![tokens.to_vec()];
    }

    let mut out = Vec::new();
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        out.push(idx.iter().map(|&i| tokens[i].clone()).collect());
        let Some(i) = (0..k).rev().find(|&i| idx[i] != i + n - k) else {
            return out;
        };
        idx[i] += 1;
        for j in i + 1..k {
            idx[j] = idx[j - 1] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NumberRange;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn compile_text(contents: &str, defaults: &JobSpec) -> CompiledQueue {
        let template = PromptTemplate::parse(contents);
        let caps = Capabilities::default();
        let table = WildcardTable::new();
        let ctx = CompileContext {
            template: &template,
            defaults,
            capabilities: &caps,
            wildcards: &table,
            overrides: SweepOverrides::default(),
            loop_index: 0,
            seed_offset: 0,
            queue_depth: 5,
        };
        compile(&ctx, &mut StdRng::seed_from_u64(3))
    }

    fn prompts(queue: &CompiledQueue) -> Vec<&str> {
        queue.jobs.iter().map(|j| j.prompt.as_str()).collect()
    }

    // -- combinations -------------------------------------------------------------

    #[test]
    fn combinations_counts() {
        let tokens: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(combinations(&tokens, 1).len(), 4);
        assert_eq!(combinations(&tokens, 2).len(), 6);
        assert_eq!(combinations(&tokens, 4), vec![tokens.clone()]);
        assert_eq!(combinations(&tokens, 9), vec![tokens.clone()]);
        assert_eq!(combinations(&tokens, 0), vec![Vec::<String>::new()]);
        assert_eq!(
            combinations(&tokens, 3)[0],
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    // -- standard -----------------------------------------------------------------

    #[test]
    fn standard_product_order() {
        let q = compile_text("[prompts]\na\nb\n[prompts]\nx\ny\n", &JobSpec::default());
        assert_eq!(prompts(&q), vec!["a x", "a y", "b x", "b y"]);
        assert_eq!(q.jobs[3].sequence, 4);
    }

    #[test]
    fn section_and_template_delimiters() {
        let q = compile_text(
            "[config]\n!DELIM = \" | \"\n[prompts 2 \", \"]\nred\nblue\n[prompts]\ncar\n",
            &JobSpec::default(),
        );
        assert_eq!(prompts(&q), vec!["red, blue | car"]);
    }

    #[test]
    fn comma_fragments_attach_to_previous() {
        let q = compile_text("[prompts]\na cat\n[prompts]\n, oil painting\n", &JobSpec::default());
        assert_eq!(prompts(&q), vec!["a cat, oil painting"]);
    }

    #[test]
    fn embedded_directive_discards_combination_and_applies_forward() {
        let q = compile_text(
            "[prompts]\ncat\n!STEPS = 40\ndog\n",
            &JobSpec::default(),
        );
        assert_eq!(prompts(&q), vec!["cat", "dog"]);
        assert_eq!(q.jobs[0].steps, NumberRange::fixed(20));
        assert_eq!(q.jobs[1].steps, NumberRange::fixed(40));
    }

    #[test]
    fn config_warnings_do_not_abort() {
        let q = compile_text(
            "[config]\nWIDTH = wide\nBOGUS = 1\njust words\n[prompts]\ncat\n",
            &JobSpec::default(),
        );
        assert_eq!(q.jobs.len(), 1);
        assert_eq!(q.jobs[0].width, 512);
        assert_eq!(q.warnings.len(), 3);
    }

    #[test]
    fn seed_offset_skips_random_seed() {
        let template = PromptTemplate::parse("[config]\nSEED = 100\n[prompts]\ncat\n");
        let caps = Capabilities::default();
        let table = WildcardTable::new();
        let defaults = JobSpec::default();
        let ctx = CompileContext {
            template: &template,
            defaults: &defaults,
            capabilities: &caps,
            wildcards: &table,
            overrides: SweepOverrides {
                ckpt_file: Some("beta".into()),
                highres_ckpt_file: None,
            },
            loop_index: 3,
            seed_offset: 2,
            queue_depth: 0,
        };
        let q = compile(&ctx, &mut StdRng::seed_from_u64(0));
        assert_eq!(q.jobs[0].seed, 102);
        assert_eq!(q.jobs[0].loop_index, 3);
        assert_eq!(q.jobs[0].ckpt_file.as_deref(), Some("beta"));

        let q = compile_text("[prompts]\ncat\n", &JobSpec::default());
        assert_eq!(q.jobs[0].seed, -1);
    }

    #[test]
    fn wildcards_expand_per_job_with_metadata() {
        let template = PromptTemplate::parse(
            "[config]\nIPTC_TITLE = __animal__\n[prompts]\na __animal__, __!iptc_title__\n",
        );
        let caps = Capabilities::default();
        let mut table = WildcardTable::new();
        table.insert("animal", vec!["fox".into()]);
        let defaults = JobSpec::default();
        let ctx = CompileContext {
            template: &template,
            defaults: &defaults,
            capabilities: &caps,
            wildcards: &table,
            overrides: SweepOverrides::default(),
            loop_index: 0,
            seed_offset: 0,
            queue_depth: 0,
        };
        let q = compile(&ctx, &mut StdRng::seed_from_u64(0));
        assert_eq!(q.jobs[0].iptc.title, "fox");
        assert_eq!(q.jobs[0].prompt, "a fox, fox");
    }

    #[test]
    fn no_sections_warns() {
        let q = compile_text("[config]\nSTEPS = 10\n", &JobSpec::default());
        assert!(q.jobs.is_empty());
        assert_eq!(q.warnings.len(), 1);
    }

    // -- random -------------------------------------------------------------------

    #[test]
    fn random_mode_fills_queue_depth() {
        let q = compile_text(
            "[config]\nMODE = random\n[prompts 1-2]\nred\nblue\ngreen\n[prompts]\ncar\n",
            &JobSpec::default(),
        );
        assert_eq!(q.control.mode, PromptMode::Random);
        assert_eq!(q.jobs.len(), 5);
        for job in &q.jobs {
            assert!(job.prompt.ends_with("car"), "{}", job.prompt);
            let words = job.prompt.split_whitespace().count();
            assert!((2..=3).contains(&words));
        }
    }

    #[test]
    fn random_mode_excludes_directive_tokens() {
        let q = compile_text(
            "[config]\nMODE = random\n[prompts 2]\ncat\n!SAMPLER = Euler\n",
            &JobSpec::default(),
        );
        assert!(q.jobs.iter().all(|j| j.prompt == "cat"));
        assert!(q.jobs.iter().all(|j| j.sampler == "Euler"));
    }

    // -- process ------------------------------------------------------------------

    #[test]
    fn process_without_go_rows() {
        let q = compile_text("[config]\nMODE = process\n[prompts]\nGo\n", &JobSpec::default());
        assert!(q.jobs.is_empty());
        assert_eq!(q.warnings.len(), 1);
    }

    #[test]
    fn process_go_without_input_warns() {
        let q = compile_text("[config]\nMODE = process\n[prompts]\ngo\n", &JobSpec::default());
        assert!(q.jobs.is_empty());
        assert_eq!(q.warnings.len(), 1);
    }
}
