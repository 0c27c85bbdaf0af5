//! Built-in skill presets.
//!
//! A skill specializes the assistant for one job: an optional system-prompt
//! addendum and an optional allowed-tool subset. The table is immutable; the
//! agent core only ever looks entries up by id.

use crate::protocol::SkillInfo;

/// One skill preset.
#[derive(Debug, Clone, Copy)]
pub struct Skill {
    pub id: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
    pub description: &'static str,
    pub system_prompt: Option<&'static str>,
    pub allowed_tools: Option<&'static [&'static str]>,
}

const READ_ONLY_TOOLS: &[&str] = &["Read", "Glob", "Grep"];
const DOC_TOOLS: &[&str] = &["Read", "Write", "Edit", "Glob", "Grep"];
const ANALYSIS_TOOLS: &[&str] = &["Read", "Bash", "Glob", "Grep", "Write"];
const UI_TOOLS: &[&str] = &["Read", "Write", "Edit", "Glob", "Grep"];

static SKILLS: &[Skill] = &[
    Skill {
        id: "code-review",
        name: "코드 리뷰",
        icon: "🔍",
        description: "코드를 수정하지 않고 읽기 전용으로 리뷰합니다",
        system_prompt: Some(
            "You are acting as a code reviewer. Read the relevant code and report \
             concrete findings with file paths and line references. Do not modify \
             any files.",
        ),
        allowed_tools: Some(READ_ONLY_TOOLS),
    },
    Skill {
        id: "ui-builder",
        name: "UI 목업",
        icon: "🎨",
        description: "HTML/CSS 목업을 만들고 미리보기를 생성합니다",
        system_prompt: Some(
            "You build self-contained HTML/CSS mockups. Write a single index.html \
             that renders standalone in a browser, then summarize what you built so \
             a screenshot preview can be captured.",
        ),
        allowed_tools: Some(UI_TOOLS),
    },
    Skill {
        id: "data-analysis",
        name: "데이터 분석",
        icon: "📊",
        description: "작업 디렉토리의 데이터를 분석하고 차트를 생성합니다",
        system_prompt: Some(
            "Analyze data files in the working directory. Prefer small scripts over \
             manual inspection, save any charts as image files, and mention the \
             saved paths in your answer.",
        ),
        allowed_tools: Some(ANALYSIS_TOOLS),
    },
    Skill {
        id: "docs",
        name: "문서 작성",
        icon: "📝",
        description: "README와 기술 문서를 작성하거나 갱신합니다",
        system_prompt: Some(
            "You write and update project documentation. Keep the existing tone and \
             structure of documents you touch.",
        ),
        allowed_tools: Some(DOC_TOOLS),
    },
    Skill {
        id: "quick-fix",
        name: "퀵 픽스",
        icon: "⚡",
        description: "작은 버그를 최소한의 변경으로 고칩니다",
        system_prompt: Some(
            "Fix the reported problem with the smallest reasonable diff. Do not \
             refactor surrounding code.",
        ),
        allowed_tools: None,
    },
];

/// All presets, in display order.
pub fn all() -> &'static [Skill] {
    SKILLS
}

/// Look a preset up by id.
pub fn find(id: &str) -> Option<&'static Skill> {
    SKILLS.iter().find(|s| s.id == id)
}

impl Skill {
    pub fn info(&self) -> SkillInfo {
        SkillInfo {
            id: self.id.to_string(),
            name: self.name.to_string(),
            icon: self.icon.to_string(),
            description: self.description.to_string(),
        }
    }
}

/// The whole table as wire-serializable infos.
pub fn infos() -> Vec<SkillInfo> {
    SKILLS.iter().map(Skill::info).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_id() {
        assert!(find("code-review").is_some());
        assert!(find("no-such-skill").is_none());
    }

    #[test]
    fn ids_are_unique() {
        let mut ids: Vec<_> = all().iter().map(|s| s.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), all().len());
    }

    #[test]
    fn review_preset_is_read_only() {
        let tools = find("code-review").unwrap().allowed_tools.unwrap();
        assert!(!tools.contains(&"Write"));
        assert!(!tools.contains(&"Bash"));
    }
}
