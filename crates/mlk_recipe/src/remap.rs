//! Install-path tokens for config files that embed absolute paths.
//!
//! At compile time every occurrence of the game, install or downloads directory in
//! a text file is replaced by a token; at install time the tokens are expanded to
//! the paths on the installing machine. Each directory is recognized in three
//! spellings: backslashes, doubled (escaped) backslashes, and forward slashes.

use camino::{Utf8Path, Utf8PathBuf};

const TOKEN_PREFIX: &str = "{--||";
const TOKEN_SUFFIX: &str = "||--}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Game,
    Install,
    Downloads,
}

impl Root {
    fn token_name(self) -> &'static str {
        match self {
            Root::Game => "GAME_PATH_MAGIC",
            Root::Install => "MO2_PATH_MAGIC",
            Root::Downloads => "DOWNLOAD_PATH_MAGIC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Spelling {
    DoubleBack,
    Back,
    Forward,
}

impl Spelling {
    fn suffix(self) -> &'static str {
        match self {
            Spelling::DoubleBack => "DOUBLE_BACK",
            Spelling::Back => "BACK",
            Spelling::Forward => "FORWARD",
        }
    }

    fn render(self, path: &str) -> String {
        let forward = path.replace('\\', "/");
        match self {
            Spelling::Forward => forward,
            Spelling::Back => forward.replace('/', "\\"),
            Spelling::DoubleBack => forward.replace('/', "\\\\"),
        }
    }
}

/// The directories substituted by tokens.
#[derive(Debug, Clone, Default)]
pub struct RemapRoots {
    pub game: Option<Utf8PathBuf>,
    pub install: Option<Utf8PathBuf>,
    pub downloads: Option<Utf8PathBuf>,
}

impl RemapRoots {
    pub fn new(game: Option<&Utf8Path>, install: Option<&Utf8Path>, downloads: Option<&Utf8Path>) -> Self {
        Self {
            game: game.map(Utf8Path::to_path_buf),
            install: install.map(Utf8Path::to_path_buf),
            downloads: downloads.map(Utf8Path::to_path_buf),
        }
    }

    /// `(token, path text)` pairs, longest path text first so nested roots win.
    fn pairs(&self) -> Vec<(String, String)> {
        let roots = [
            (Root::Game, &self.game),
            (Root::Install, &self.install),
            (Root::Downloads, &self.downloads),
        ];
        let mut pairs: Vec<(String, String)> = roots
            .into_iter()
            .filter_map(|(root, path)| Some((root, path.as_ref()?)))
            .flat_map(|(root, path)| {
                let path = path.as_str().trim_end_matches(['/', '\\']);
                [Spelling::DoubleBack, Spelling::Back, Spelling::Forward]
                    .into_iter()
                    .map(move |spelling| {
                        (
                            token(root, spelling),
                            spelling.render(path),
                        )
                    })
            })
            .filter(|(_, text)| !text.is_empty())
            .collect();
        pairs.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
        pairs
    }

    /// Replace known directories in `text` with tokens, ignoring ASCII case.
    ///
    /// Returns `None` if nothing was replaced.
    pub fn tokenize(&self, text: &str) -> Option<String> {
        let mut out = text.to_string();
        let mut changed = false;
        for (token, path) in self.pairs() {
            if let Some(replaced) = replace_ignore_case(&out, &path, &token) {
                out = replaced;
                changed = true;
            }
        }
        changed.then_some(out)
    }

    /// Replace tokens in `text` with this machine's directories.
    pub fn expand(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (token, path) in self.pairs() {
            if out.contains(&token) {
                out = out.replace(&token, &path);
            }
        }
        out
    }
}

fn token(root: Root, spelling: Spelling) -> String {
    format!(
        "{}{}_{}{}",
        TOKEN_PREFIX,
        root.token_name(),
        spelling.suffix(),
        TOKEN_SUFFIX
    )
}

/// Whether `text` contains any install-path token.
pub fn has_tokens(text: &str) -> bool {
    text.contains(TOKEN_PREFIX) && text.contains(TOKEN_SUFFIX)
}

fn replace_ignore_case(haystack: &str, needle: &str, with: &str) -> Option<String> {
    let lower_hay = haystack.to_ascii_lowercase();
    let lower_needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (start, _) in lower_hay.match_indices(&lower_needle) {
        if start < last {
            continue;
        }
        out.push_str(&haystack[last..start]);
        out.push_str(with);
        last = start + needle.len();
    }
    if last == 0 {
        return None;
    }
    out.push_str(&haystack[last..]);
    Some(out)
}
