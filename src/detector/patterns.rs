use regex::Regex;

use super::OutputTail;
use crate::prompt::{Choice, PromptType};

/// Single-line prompts must be the last non-empty line.
const QUESTION_REACH: usize = 1;
/// How far from the end the last option of a menu may sit.
const MENU_REACH: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub matcher: &'static str,
    pub prompt_type: PromptType,
    pub score: f64,
    pub choices: Vec<Choice>,
}

/// Built-in prompt shapes, most specific first.
pub struct PatternCatalogue {
    yes_no: Regex,
    confirm_enter: Regex,
    option_line: Regex,
    checkbox_line: Regex,
    select_hint: Regex,
    input_marker: Regex,
}

impl PatternCatalogue {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            yes_no: Regex::new(
                r"(?i)(\[\s*y(es)?\s*/\s*n(o)?\s*\]|\(\s*y(es)?\s*/\s*n(o)?\s*\)|\ballow\?)\s*:?\s*$",
            )?,
            confirm_enter: Regex::new(
                r"(?i)(press\s+(enter|return)|hit\s+(enter|return)|\(enter to confirm\)|enter to continue)",
            )?,
            option_line: Regex::new(r"^\s*(?:[❯>›▶*]\s*)?(\d{1,2})[.)]\s+(\S.*?)\s*$")?,
            checkbox_line: Regex::new(r"^\s*(?:[❯>›]\s*)?(?:\[[ xX✓✔]\]|[◯◉○●☐☑])\s+\S")?,
            select_hint: Regex::new(r"(?i)space\s+to\s+(select|toggle)")?,
            input_marker: Regex::new(r"^\s*[>❯›]\s*$")?,
        })
    }

    /// Match a prompt that is waiting at the end of the output.
    ///
    /// Everything checked here has to touch the tail: the last non-empty
    /// lines or the unterminated partial line.
    pub fn match_tail(&self, tail: &OutputTail) -> Option<PatternMatch> {
        let lines = tail.non_empty_lines();
        if lines.is_empty() {
            return None;
        }
        self.multi_select(&lines, true)
            .or_else(|| self.numbered_choice(&lines, true))
            .or_else(|| self.yes_no(&lines))
            .or_else(|| self.confirm_enter(&lines))
            .or_else(|| self.free_text(tail))
    }

    /// Best guess at the prompt shape for a weak signal. Any option or
    /// question anywhere in the tail counts; the fallback is free text.
    pub fn infer(&self, tail: &OutputTail) -> (PromptType, Vec<Choice>) {
        let lines = tail.non_empty_lines();
        if let Some(found) = self
            .multi_select(&lines, false)
            .or_else(|| self.numbered_choice(&lines, false))
        {
            return (found.prompt_type, found.choices);
        }
        if lines.iter().any(|line| self.yes_no.is_match(line)) {
            return (PromptType::YesNo, Vec::new());
        }
        if lines.iter().any(|line| self.confirm_enter.is_match(line)) {
            return (PromptType::ConfirmEnter, Vec::new());
        }
        (PromptType::FreeText, Vec::new())
    }

    fn yes_no(&self, lines: &[&str]) -> Option<PatternMatch> {
        last_n(lines, QUESTION_REACH)
            .iter()
            .any(|line| self.yes_no.is_match(line))
            .then(|| PatternMatch {
                matcher: "yes_no",
                prompt_type: PromptType::YesNo,
                score: 0.95,
                choices: Vec::new(),
            })
    }

    fn confirm_enter(&self, lines: &[&str]) -> Option<PatternMatch> {
        last_n(lines, QUESTION_REACH)
            .iter()
            .any(|line| self.confirm_enter.is_match(line))
            .then(|| PatternMatch {
                matcher: "confirm_enter",
                prompt_type: PromptType::ConfirmEnter,
                score: 0.85,
                choices: Vec::new(),
            })
    }

    fn numbered_choice(&self, lines: &[&str], anchored: bool) -> Option<PatternMatch> {
        let mut choices = Vec::new();
        let mut last_option_index = None;
        for (index, line) in lines.iter().enumerate() {
            if let Some(caps) = self.option_line.captures(line)
                && let Ok(number) = caps[1].parse::<u32>()
            {
                // a menu restarting at 1 replaces any earlier list
                if number == 1 {
                    choices.clear();
                }
                choices.push(Choice {
                    number,
                    label: caps[2].to_string(),
                });
                last_option_index = Some(index);
            }
        }

        if choices.len() < 2 {
            return None;
        }
        if anchored && last_option_index.is_some_and(|i| lines.len() - i > MENU_REACH) {
            return None;
        }
        Some(PatternMatch {
            matcher: "numbered_choice",
            prompt_type: PromptType::NumberedChoice,
            score: 0.9,
            choices,
        })
    }

    fn multi_select(&self, lines: &[&str], anchored: bool) -> Option<PatternMatch> {
        let scope = if anchored {
            last_n(lines, MENU_REACH + 2)
        } else {
            lines
        };
        let boxes = scope
            .iter()
            .filter(|line| self.checkbox_line.is_match(line))
            .count();
        let hinted = scope.iter().any(|line| self.select_hint.is_match(line));
        (boxes >= 2 || hinted).then(|| PatternMatch {
            matcher: "multi_select",
            prompt_type: PromptType::MultiSelect,
            score: 0.88,
            choices: Vec::new(),
        })
    }

    fn free_text(&self, tail: &OutputTail) -> Option<PatternMatch> {
        let partial = tail.partial().trim_end();
        if partial.is_empty() {
            return None;
        }
        let asks = partial.ends_with(':') || partial.ends_with('?');
        (asks || self.input_marker.is_match(partial)).then(|| PatternMatch {
            matcher: "free_text",
            prompt_type: PromptType::FreeText,
            score: 0.75,
            choices: Vec::new(),
        })
    }
}

fn last_n<'a, 'b>(lines: &'a [&'b str], n: usize) -> &'a [&'b str] {
    &lines[lines.len().saturating_sub(n)..]
}
