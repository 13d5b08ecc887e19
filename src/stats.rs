//! Pattern-based extraction of statistical metadata from executed analysis
//! code and its tool output. No semantic understanding is attempted; the
//! extractors recognize the surface forms common statistics libraries print.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Analysis stage a fact belongs to
pub const STAGES: &[&str] = &[
    "assumption_check",
    "descriptive",
    "hypothesis_test",
    "modeling",
    "post_hoc",
];

/// Known test name patterns and the stage each implies, in match order.
/// `primary_test` is the LAST one matched in the combined text.
static TEST_PATTERNS: LazyLock<Vec<(Regex, &'static str, &'static str)>> = LazyLock::new(|| {
    let table: &[(&str, &str, &str)] = &[
        (r"(?i)shapiro[\s_-]?wilk|shapiro\s*\(", "shapiro-wilk", "assumption_check"),
        (r"(?i)levene", "levene", "assumption_check"),
        (r"(?i)kolmogorov[\s_-]?smirnov|\bkstest\b", "kolmogorov-smirnov", "assumption_check"),
        (r"(?i)\bdescribe\s*\(|value_counts\s*\(|\bcrosstab\b", "descriptive", "descriptive"),
        (r"(?i)t[\s_-]?test|ttest_ind|ttest_rel|ttest_1samp", "t-test", "hypothesis_test"),
        (r"(?i)mann[\s_-]?whitney|mannwhitneyu", "mann-whitney", "hypothesis_test"),
        (r"(?i)wilcoxon", "wilcoxon", "hypothesis_test"),
        (r"(?i)kruskal", "kruskal-wallis", "hypothesis_test"),
        (r"(?i)f_oneway|\banova\b", "anova", "hypothesis_test"),
        (r"(?i)chi2_contingency|chi[\s_-]?squared?", "chi-square", "hypothesis_test"),
        (r"(?i)pearsonr|pearson\s+correlation", "pearson", "hypothesis_test"),
        (r"(?i)spearmanr|spearman\s+correlation", "spearman", "hypothesis_test"),
        (r"(?i)\bols\s*\(|linear\s+regression|logisticregression|\blogit\s*\(", "regression", "modeling"),
        (r"(?i)tukey|pairwise_tukeyhsd", "tukey-hsd", "post_hoc"),
        (r"(?i)bonferroni", "bonferroni", "post_hoc"),
    ];
    table
        .iter()
        .map(|(pat, name, stage)| (Regex::new(pat).unwrap(), *name, *stage))
        .collect()
});

static P_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bp[-_\s]?(?:value)?\s*[:=<]\s*([0-9]*\.?[0-9]+(?:[eE][+-]?[0-9]+)?)")
        .unwrap()
});

static TEST_STAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(W|t|F|U|H|z|r|rho|chi2|χ2)[-_\s]?(?:statistic|stat)?\s*[:=]\s*(-?[0-9]*\.?[0-9]+(?:[eE][+-]?[0-9]+)?)",
    )
    .unwrap()
});

static EFFECT_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:cohen'?s\s+d|eta\s*squared|cram[eé]r'?s\s+v|effect\s+size)\s*[:=]?\s*(-?[0-9]*\.?[0-9]+)",
    )
    .unwrap()
});

static SAMPLE_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:n\s*=\s*|observations[:\s]+|sample\s+size[:\s]+)([0-9]+)\b").unwrap()
});

static DATASET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:read_csv|read_excel|read_parquet)\(\s*['"]([^'"]+)['"]|dataset[:\s]+([\w.-]+\.(?:csv|xlsx|parquet))"#)
        .unwrap()
});

static COLUMN_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\w+\[\s*['"]([A-Za-z_][A-Za-z0-9_ ]*)['"]\s*\]"#).unwrap()
});

static ATTR_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:df|data|frame)\.([a-z_][a-z0-9_]*)\b").unwrap());

/// Pandas/numpy members that look like column attribute access but are not
/// data variables
const METHOD_BLACKLIST: &[&str] = &[
    "describe", "head", "tail", "info", "shape", "columns", "index", "dtypes", "mean",
    "median", "std", "var", "sum", "count", "min", "max", "dropna", "fillna", "isna",
    "isnull", "notna", "groupby", "merge", "join", "sort_values", "value_counts", "corr",
    "cov", "apply", "map", "loc", "iloc", "values", "unique", "nunique", "sample", "copy",
    "rename", "drop", "reset_index", "set_index", "astype", "plot", "hist", "to_csv",
];

/// Python keywords filtered from variable candidates
const KEYWORD_FILTER: &[&str] = &[
    "and", "or", "not", "if", "else", "for", "while", "in", "is", "def", "return",
    "import", "from", "as", "with", "lambda", "none", "true", "false", "print",
];

/// Statistical metadata extracted from one assistant/tool pair
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatMetadata {
    pub test_types: Vec<String>,
    /// Last test matched in the text
    pub primary_test: Option<String>,
    pub analysis_stage: Option<String>,
    pub variables: Vec<String>,
    pub dataset: Option<String>,
    pub p_value: Option<String>,
    /// Labelled statistic, e.g. `W=0.923`
    pub test_statistic: Option<String>,
    pub effect_size: Option<String>,
    pub sample_size: Option<String>,
    pub sig_at_05: Option<bool>,
    pub sig_at_01: Option<bool>,
    pub sig_at_001: Option<bool>,
}

impl StatMetadata {
    /// Extract metadata from analysis code and the captured tool output
    pub fn extract(code: &str, tool_output: &str) -> Self {
        let combined = format!("{code}\n{tool_output}");
        let mut meta = StatMetadata::default();

        let mut last_match: Option<(usize, &str, &str)> = None;
        for &(ref re, name, stage) in TEST_PATTERNS.iter() {
            for m in re.find_iter(&combined) {
                if !meta.test_types.iter().any(|t| t == name) {
                    meta.test_types.push(name.to_string());
                }
                match last_match {
                    Some((pos, _, _)) if pos >= m.start() => {}
                    _ => last_match = Some((m.start(), name, stage)),
                }
            }
        }
        if let Some((_, name, stage)) = last_match {
            meta.primary_test = Some(name.to_string());
            meta.analysis_stage = Some(stage.to_string());
        }

        if let Some(caps) = P_VALUE_RE.captures_iter(&combined).last() {
            let p = caps[1].to_string();
            if let Ok(value) = p.parse::<f64>() {
                meta.sig_at_05 = Some(value < 0.05);
                meta.sig_at_01 = Some(value < 0.01);
                meta.sig_at_001 = Some(value < 0.001);
            }
            meta.p_value = Some(p);
        }

        if let Some(caps) = TEST_STAT_RE.captures_iter(tool_output).last() {
            meta.test_statistic = Some(format!("{}={}", &caps[1], &caps[2]));
        } else if let Some(caps) = TEST_STAT_RE.captures_iter(&combined).last() {
            meta.test_statistic = Some(format!("{}={}", &caps[1], &caps[2]));
        }

        if let Some(caps) = EFFECT_SIZE_RE.captures(&combined) {
            meta.effect_size = Some(caps[1].to_string());
        }

        if let Some(caps) = SAMPLE_SIZE_RE.captures(&combined) {
            meta.sample_size = Some(caps[1].to_string());
        }

        if let Some(caps) = DATASET_RE.captures(&combined) {
            meta.dataset = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str().to_string());
        }

        meta.variables = extract_variables(code);
        meta
    }

    /// True when nothing statistical was recognized
    pub fn is_empty(&self) -> bool {
        self.primary_test.is_none()
            && self.p_value.is_none()
            && self.test_statistic.is_none()
            && self.variables.is_empty()
            && self.dataset.is_none()
    }

    /// Flatten into document metadata values
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if !self.test_types.is_empty() {
            map.insert("test_types".to_string(), self.test_types.join(","));
        }
        if let Some(ref v) = self.primary_test {
            map.insert("primary_test".to_string(), v.clone());
        }
        if let Some(ref v) = self.analysis_stage {
            map.insert("analysis_stage".to_string(), v.clone());
        }
        if !self.variables.is_empty() {
            map.insert("variables".to_string(), self.variables.join(","));
        }
        if let Some(ref v) = self.dataset {
            map.insert("dataset".to_string(), v.clone());
        }
        if let Some(ref v) = self.p_value {
            map.insert("p_value".to_string(), v.clone());
        }
        if let Some(ref v) = self.test_statistic {
            map.insert("test_statistic".to_string(), v.clone());
        }
        if let Some(ref v) = self.effect_size {
            map.insert("effect_size".to_string(), v.clone());
        }
        if let Some(ref v) = self.sample_size {
            map.insert("sample_size".to_string(), v.clone());
        }
        if let Some(v) = self.sig_at_05 {
            map.insert("sig_at_05".to_string(), v.to_string());
        }
        if let Some(v) = self.sig_at_01 {
            map.insert("sig_at_01".to_string(), v.to_string());
        }
        if let Some(v) = self.sig_at_001 {
            map.insert("sig_at_001".to_string(), v.to_string());
        }
        map
    }

    /// Single-line lexical form for BM25-oriented fact storage
    pub fn to_structured_line(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref t) = self.primary_test {
            parts.push(format!("test:{t}"));
        }
        if let Some(ref s) = self.analysis_stage {
            parts.push(format!("stage:{s}"));
        }
        if let Some(ref p) = self.p_value {
            parts.push(format!("p:{p}"));
        }
        if let Some(ref s) = self.test_statistic {
            parts.push(format!("stat:{s}"));
        }
        if !self.variables.is_empty() {
            parts.push(format!("variables:{}", self.variables.join(",")));
        }
        if let Some(ref d) = self.dataset {
            parts.push(format!("dataset:{d}"));
        }
        if let Some(sig) = self.sig_at_05 {
            parts.push(format!("sig:{sig}"));
        }
        parts.join(" ")
    }
}

/// First test keyword recognized in free text, e.g. a user query
pub fn detect_test(text: &str) -> Option<String> {
    for (re, name, _) in TEST_PATTERNS.iter() {
        if re.is_match(text) {
            return Some(name.to_string());
        }
    }
    None
}

/// Column/variable references in analysis code, filtered against pandas
/// method names and python keywords
fn extract_variables(code: &str) -> Vec<String> {
    let mut variables = Vec::new();

    for caps in COLUMN_REF_RE.captures_iter(code) {
        let name = caps[1].trim().to_string();
        if accept_variable(&name) && !variables.contains(&name) {
            variables.push(name);
        }
    }

    for caps in ATTR_REF_RE.captures_iter(code) {
        let name = caps[1].to_string();
        if accept_variable(&name) && !variables.contains(&name) {
            variables.push(name);
        }
    }

    variables
}

fn accept_variable(name: &str) -> bool {
    let lower = name.to_lowercase();
    !METHOD_BLACKLIST.contains(&lower.as_str()) && !KEYWORD_FILTER.contains(&lower.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapiro_extraction() {
        let code = "from scipy import stats\nw, p = stats.shapiro(df['residuals'])\nprint(f'W={w:.3f}, p={p:.3f}')";
        let output = "W=0.923, p=0.016";
        let meta = StatMetadata::extract(code, output);

        assert_eq!(meta.primary_test.as_deref(), Some("shapiro-wilk"));
        assert_eq!(meta.analysis_stage.as_deref(), Some("assumption_check"));
        assert_eq!(meta.variables, vec!["residuals".to_string()]);
        assert_eq!(meta.p_value.as_deref(), Some("0.016"));
        assert_eq!(meta.test_statistic.as_deref(), Some("W=0.923"));
        assert_eq!(meta.sig_at_05, Some(true));
        assert_eq!(meta.sig_at_01, Some(false));
        assert_eq!(meta.sig_at_001, Some(false));
    }

    #[test]
    fn test_primary_test_is_last_match() {
        let code = "stats.shapiro(df['x'])\nstats.ttest_ind(df['x'], df['y'])";
        let meta = StatMetadata::extract(code, "t-statistic: 2.34, p-value: 0.023");
        assert_eq!(meta.primary_test.as_deref(), Some("t-test"));
        assert_eq!(meta.analysis_stage.as_deref(), Some("hypothesis_test"));
        assert!(meta.test_types.contains(&"shapiro-wilk".to_string()));
        assert!(meta.test_types.contains(&"t-test".to_string()));
    }

    #[test]
    fn test_dataset_from_read_csv() {
        let code = "df = pd.read_csv('sales_2024.csv')";
        let meta = StatMetadata::extract(code, "");
        assert_eq!(meta.dataset.as_deref(), Some("sales_2024.csv"));
    }

    #[test]
    fn test_variables_filter_methods_and_keywords() {
        let code = "df['income'].describe()\ndf.dropna()\ndf.age\nprint(df['head'])";
        let meta = StatMetadata::extract(code, "");
        assert!(meta.variables.contains(&"income".to_string()));
        assert!(meta.variables.contains(&"age".to_string()));
        assert!(!meta.variables.contains(&"dropna".to_string()));
        assert!(!meta.variables.contains(&"head".to_string()));
    }

    #[test]
    fn test_sample_size_and_effect_size() {
        let output = "n=150 observations\nCohen's d = 0.42";
        let meta = StatMetadata::extract("", output);
        assert_eq!(meta.sample_size.as_deref(), Some("150"));
        assert_eq!(meta.effect_size.as_deref(), Some("0.42"));
    }

    #[test]
    fn test_scientific_notation_p_value() {
        let meta = StatMetadata::extract("", "F=12.7, p = 3.2e-05");
        assert_eq!(meta.p_value.as_deref(), Some("3.2e-05"));
        assert_eq!(meta.sig_at_001, Some(true));
    }

    #[test]
    fn test_empty_when_nothing_recognized() {
        let meta = StatMetadata::extract("x = 1 + 1", "2");
        assert!(meta.is_empty());
        assert!(meta.to_structured_line().is_empty());
    }

    #[test]
    fn test_structured_line_shape() {
        let code = "stats.shapiro(df['residuals'])";
        let output = "W=0.923, p=0.016, n=48";
        let line = StatMetadata::extract(code, output).to_structured_line();
        assert!(line.starts_with("test:shapiro-wilk stage:assumption_check"));
        assert!(line.contains("p:0.016"));
        assert!(line.contains("stat:W=0.923"));
        assert!(line.contains("variables:residuals"));
        assert!(line.contains("sig:true"));
    }

    #[test]
    fn test_to_map_round_trip_keys() {
        let meta = StatMetadata::extract(
            "stats.levene(df['a'], df['b'])",
            "statistic: 1.9, p = 0.17",
        );
        let map = meta.to_map();
        assert_eq!(map.get("primary_test").map(String::as_str), Some("levene"));
        assert_eq!(map.get("sig_at_05").map(String::as_str), Some("false"));
        assert!(map.contains_key("variables"));
    }
}
