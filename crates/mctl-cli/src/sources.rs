use mctl_core::resolve::{ResolveError, ResolverSource};
use mctl_core::{looks_like_mission_id, normalize_mission_ref, MissionView};
use std::fs;
use std::path::{Path, PathBuf};

/// Missions prefetched from the control plane. Canonical ids resolve against
/// every record, archived included; the picker only offers archived ones when
/// asked to.
pub struct MissionSource {
    missions: Vec<MissionView>,
    offer_archived: bool,
}

impl MissionSource {
    pub fn new(missions: Vec<MissionView>, offer_archived: bool) -> Self {
        Self {
            missions,
            offer_archived,
        }
    }
}

impl ResolverSource for MissionSource {
    type Item = MissionView;

    fn noun(&self) -> &str {
        "mission"
    }

    fn try_canonical(&self, input: &str) -> Option<Result<MissionView, ResolveError>> {
        if !looks_like_mission_id(input) {
            return None;
        }
        let wanted = normalize_mission_ref(input);
        let mut hits = self
            .missions
            .iter()
            .filter(|view| view.mission.id.starts_with(&wanted));
        let first = hits.next();
        let result = match (first, hits.next()) {
            (Some(view), None) => Ok(view.clone()),
            (Some(_), Some(_)) => Err(ResolveError::Ambiguous {
                noun: "mission".to_string(),
                input: input.to_string(),
            }),
            (None, _) => Err(ResolveError::NotFound {
                noun: "mission".to_string(),
                input: input.to_string(),
            }),
        };
        Some(result)
    }

    fn list_items(&self) -> Result<Vec<MissionView>, ResolveError> {
        Ok(self
            .missions
            .iter()
            .filter(|view| self.offer_archived || !view.mission.status.is_archived())
            .cloned()
            .collect())
    }

    fn search_text(&self, view: &MissionView) -> String {
        let mission = &view.mission;
        [
            Some(mission.short_id()),
            mission.name.as_deref(),
            mission.repo.as_deref(),
            mission.cron_job.as_deref(),
            mission.description.as_deref(),
            Some(view.state.as_str()),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
    }

    fn format_row(&self, view: &MissionView) -> Vec<String> {
        mission_row(view)
    }
}

/// Shared by the picker and `mctl list`.
pub fn mission_row(view: &MissionView) -> Vec<String> {
    let mission = &view.mission;
    vec![
        mission.short_id().to_string(),
        view.state.to_string(),
        mission.label().to_string(),
        mission.repo.clone().unwrap_or_else(|| "-".to_string()),
        mission.cron_job.clone().unwrap_or_else(|| "-".to_string()),
        mission
            .description
            .clone()
            .unwrap_or_default()
            .lines()
            .next()
            .unwrap_or_default()
            .to_string(),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    /// `owner/name`
    pub slug: String,
    pub path: PathBuf,
}

/// Checkouts laid out as `repos/<owner>/<name>/`.
pub struct RepoSource {
    root: PathBuf,
}

impl RepoSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResolverSource for RepoSource {
    type Item = Repo;

    fn noun(&self) -> &str {
        "repository"
    }

    fn try_canonical(&self, input: &str) -> Option<Result<Repo, ResolveError>> {
        let (owner, name) = input.trim().split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') || input.contains(' ') {
            return None;
        }
        let path = self.root.join(owner).join(name);
        path.is_dir().then(|| {
            Ok(Repo {
                slug: format!("{owner}/{name}"),
                path,
            })
        })
    }

    fn list_items(&self) -> Result<Vec<Repo>, ResolveError> {
        let mut repos = Vec::new();
        for owner in sorted_entries(&self.root)? {
            if !owner.is_dir() {
                continue;
            }
            let Some(owner_name) = file_name(&owner) else {
                continue;
            };
            for checkout in sorted_entries(&owner)? {
                if !checkout.is_dir() {
                    continue;
                }
                if let Some(name) = file_name(&checkout) {
                    repos.push(Repo {
                        slug: format!("{owner_name}/{name}"),
                        path: checkout,
                    });
                }
            }
        }
        Ok(repos)
    }

    fn search_text(&self, repo: &Repo) -> String {
        repo.slug.clone()
    }

    fn format_row(&self, repo: &Repo) -> Vec<String> {
        vec![repo.slug.clone(), repo.path.display().to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    pub path: PathBuf,
}

/// Markdown prompt templates in `templates/<name>.md`.
pub struct TemplateSource {
    root: PathBuf,
}

impl TemplateSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResolverSource for TemplateSource {
    type Item = Template;

    fn noun(&self) -> &str {
        "template"
    }

    fn try_canonical(&self, input: &str) -> Option<Result<Template, ResolveError>> {
        let name = input.trim();
        if name.contains(char::is_whitespace) || name.contains('/') {
            return None;
        }
        let path = self.root.join(format!("{name}.md"));
        path.is_file().then(|| {
            Ok(Template {
                name: name.to_string(),
                path,
            })
        })
    }

    fn list_items(&self) -> Result<Vec<Template>, ResolveError> {
        Ok(sorted_entries(&self.root)?
            .into_iter()
            .filter(|path| path.is_file())
            .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
            .filter_map(|path| {
                let name = path.file_stem()?.to_str()?.to_string();
                Some(Template { name, path })
            })
            .collect())
    }

    fn search_text(&self, template: &Template) -> String {
        template.name.clone()
    }

    fn format_row(&self, template: &Template) -> Vec<String> {
        let summary = fs::read_to_string(&template.path)
            .ok()
            .and_then(|body| {
                body.lines()
                    .map(|line| line.trim_start_matches('#').trim().to_string())
                    .find(|line| !line.is_empty())
            })
            .unwrap_or_default();
        vec![template.name.clone(), summary]
    }
}

/// A missing directory lists as empty.
fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, ResolveError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(ResolveError::Source(format!(
                "failed to read {}: {err}",
                dir.display()
            )))
        }
    };
    let mut paths = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| file_name(path).is_some_and(|name| !name.starts_with('.')))
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name()?.to_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mctl_core::resolve::{resolve, PickOutcome, PickRequest, Picker, Resolution, ResolveOptions};
    use mctl_core::{Mission, MissionState, StoredStatus};
    use tempfile::TempDir;

    struct NoPicker;

    impl Picker for NoPicker {
        fn pick(&self, _request: &PickRequest<'_>) -> Result<PickOutcome, ResolveError> {
            Err(ResolveError::Picker("unexpected picker".to_string()))
        }
    }

    fn view(id: &str, name: &str, status: StoredStatus) -> MissionView {
        let now = Utc::now();
        MissionView {
            mission: Mission {
                id: id.to_string(),
                status,
                name: Some(name.to_string()),
                repo: Some("acme/widgets".to_string()),
                description: None,
                workspace: PathBuf::from("/tmp").join(id),
                pane_id: None,
                cron_job: None,
                config_snapshot: None,
                created_at: now,
                updated_at: now,
                last_heartbeat: None,
            },
            state: if status.is_archived() {
                MissionState::Archived
            } else {
                MissionState::Stopped
            },
            pid: None,
        }
    }

    fn options() -> ResolveOptions<'static> {
        ResolveOptions {
            prompt: "mission> ",
            multi: false,
        }
    }

    #[test]
    fn mission_ids_resolve_canonically_including_archived() {
        let source = MissionSource::new(
            vec![
                view("aaaa1111000000000000000000000001", "alpha", StoredStatus::Active),
                view("bbbb2222000000000000000000000002", "beta", StoredStatus::Archived),
            ],
            false,
        );
        let found = resolve(&source, &NoPicker, "BBBB2222", options()).expect("resolve");
        let Resolution::Selected(items) = found else {
            panic!("expected selection");
        };
        assert_eq!(items[0].mission.label(), "beta");

        assert!(matches!(
            resolve(&source, &NoPicker, "cccc3333", options()),
            Err(ResolveError::NotFound { .. })
        ));
        assert_eq!(source.list_items().expect("items").len(), 1);
    }

    #[test]
    fn shared_short_prefix_is_ambiguous() {
        let source = MissionSource::new(
            vec![
                view("abcd1234000000000000000000000001", "one", StoredStatus::Active),
                view("abcd1234000000000000000000000002", "two", StoredStatus::Active),
            ],
            true,
        );
        assert!(matches!(
            source.try_canonical("abcd1234"),
            Some(Err(ResolveError::Ambiguous { .. }))
        ));
    }

    #[test]
    fn mission_search_covers_name_repo_and_state() {
        let source = MissionSource::new(
            vec![
                view("aaaa1111000000000000000000000001", "flaky tests", StoredStatus::Active),
                view("bbbb2222000000000000000000000002", "release notes", StoredStatus::Active),
            ],
            false,
        );
        let found = resolve(&source, &NoPicker, "widgets flaky", options());
        assert!(matches!(found, Err(ResolveError::Picker(_))), "order matters");

        let found = resolve(&source, &NoPicker, "flaky widgets stopped", options())
            .expect("resolve");
        assert_eq!(found.into_items()[0].mission.label(), "flaky tests");
    }

    #[test]
    fn repos_are_two_levels_deep() {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("acme/widgets")).expect("repo");
        fs::create_dir_all(dir.path().join("acme/gadgets")).expect("repo");
        fs::create_dir_all(dir.path().join("octo/widgets")).expect("repo");
        fs::write(dir.path().join("acme/README"), "stray file").expect("file");

        let source = RepoSource::new(dir.path());
        let slugs = source
            .list_items()
            .expect("list")
            .into_iter()
            .map(|repo| repo.slug)
            .collect::<Vec<_>>();
        assert_eq!(slugs, vec!["acme/gadgets", "acme/widgets", "octo/widgets"]);

        let direct = source.try_canonical("octo/widgets").expect("canonical");
        assert_eq!(direct.expect("repo").path, dir.path().join("octo/widgets"));
        assert!(source.try_canonical("octo/missing").is_none());
        assert!(source.try_canonical("widgets").is_none());
    }

    #[test]
    fn templates_are_markdown_stems() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("bugfix.md"), "# Fix a bug\n\nSteps").expect("template");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("other");

        let source = TemplateSource::new(dir.path());
        let templates = source.list_items().expect("list");
        assert_eq!(templates.len(), 1);
        assert_eq!(
            source.format_row(&templates[0]),
            vec!["bugfix".to_string(), "Fix a bug".to_string()]
        );
        assert!(source.try_canonical("bugfix").is_some());
        assert!(source.try_canonical("feature").is_none());
        assert!(TemplateSource::new(dir.path().join("missing"))
            .list_items()
            .expect("missing dir")
            .is_empty());
    }
}
