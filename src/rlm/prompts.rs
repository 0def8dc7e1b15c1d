use std::fmt;
use std::str::FromStr;

/// Language of the system prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PromptLanguage {
    #[default]
    English,
    Japanese,
}

impl FromStr for PromptLanguage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "en" | "english" => Ok(Self::English),
            "ja" | "japanese" => Ok(Self::Japanese),
            other => Err(format!("unknown prompt language '{}' (expected en or ja)", other)),
        }
    }
}

impl fmt::Display for PromptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::English => write!(f, "en"),
            Self::Japanese => write!(f, "ja"),
        }
    }
}

const SYSTEM_PROMPT_EN: &str = r#"You are a Recursive Language Model. You interact with context through a Python REPL environment.

The context is stored in variable `context` (not in this prompt). Size: {size} characters.

Available in environment:
- context: str (the document to analyze)
- query: str (the question: "{query}")
- recursive_llm(sub_query, sub_context) -> str (recursively process sub-context)
- recursive_llm_batch([(sub_query, sub_context), ...]) -> list[str] (several sub-contexts at once)
- re, json, math, datetime, timedelta, Counter, defaultdict: ready to use, no imports

Write Python code to answer the query. The last expression or print() output will be shown to you.
Imports, file access and names starting with an underscore are not available.

Examples:
- print(context[:100])  # See first 100 chars
- errors = re.findall(r'ERROR', context)  # Find all ERROR
- count = len(errors); print(count)  # Count and show

When you have the answer, use FINAL("answer") - this is NOT a function, just write it as text on its own line.
To answer with a variable, write FINAL_VAR(variable_name) on its own line.

Depth: {depth}"#;

const SYSTEM_PROMPT_JA: &str = r#"あなたはRecursive Language Model(RLM)です。Python REPL環境を通じてコンテキストと対話します。

コンテキストは変数 `context` に格納されています（このプロンプト内ではありません）。サイズ: {size} 文字。

環境で使用可能なもの:
- context: str (分析対象のドキュメント)
- query: str (質問: "{query}")
- recursive_llm(sub_query, sub_context) -> str (サブコンテキストを再帰的に処理する)
- recursive_llm_batch([(sub_query, sub_context), ...]) -> list[str] (複数のサブコンテキストをまとめて処理する)
- re, json, math, datetime, timedelta, Counter, defaultdict: インポート不要で使用可能

質問に答えるためのPythonコードを書いてください。最後の式または print() の出力が表示されます。
import、ファイルアクセス、アンダースコアで始まる名前は使用できません。

例:
- print(context[:100])  # 最初の100文字を確認
- errors = re.findall(r'ERROR', context)  # 'ERROR'をすべて検索
- count = len(errors); print(count)  # カウントして表示

答えが得られたら、FINAL("answer") を使用してください。これは関数ではありません。1行のテキストとして書いてください。
変数で答える場合は FINAL_VAR(変数名) を1行で書いてください。

深さ: {depth}"#;

/// System instruction for a session. Only the document's size is mentioned;
/// the document itself stays in the sandbox.
pub fn build_system_prompt(context_chars: usize, depth: u32, language: PromptLanguage) -> String {
    let template = match language {
        PromptLanguage::English => SYSTEM_PROMPT_EN,
        PromptLanguage::Japanese => SYSTEM_PROMPT_JA,
    };
    template
        .replace("{size}", &group_thousands(context_chars))
        .replace("{depth}", &depth.to_string())
}

pub fn build_user_prompt(query: &str) -> String {
    query.to_string()
}

/// 1234567 -> "1,234,567"
fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(100000), "100,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }

    #[test]
    fn test_system_prompt_mentions_size_and_depth() {
        let prompt = build_system_prompt(100_000, 2, PromptLanguage::English);
        assert!(prompt.contains("Size: 100,000 characters"));
        assert!(prompt.ends_with("Depth: 2"));
        assert!(prompt.contains("FINAL(\"answer\")"));
        // the literal placeholder is part of the wording, not substituted
        assert!(prompt.contains("\"{query}\""));
    }

    #[test]
    fn test_japanese_prompt() {
        let prompt = build_system_prompt(1500, 0, PromptLanguage::Japanese);
        assert!(prompt.contains("サイズ: 1,500 文字"));
        assert!(prompt.ends_with("深さ: 0"));
    }

    #[test]
    fn test_language_from_str() {
        assert_eq!("ja".parse::<PromptLanguage>(), Ok(PromptLanguage::Japanese));
        assert_eq!("English".parse::<PromptLanguage>(), Ok(PromptLanguage::English));
        assert!("fr".parse::<PromptLanguage>().is_err());
    }
}
