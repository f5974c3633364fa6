use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodebookError {
    #[error("codebook alphabet is empty")]
    EmptyAlphabet,
    #[error("symbol '{0}' appears more than once in the alphabet")]
    DuplicateSymbol(char),
    #[error("codebook has no entries")]
    EmptyCodebook,
    #[error("code '{0}' appears more than once in the codebook")]
    DuplicateCode(String),
    #[error("code '{code}' has length {found}, expected {expected}")]
    CodeLength {
        code: String,
        expected: usize,
        found: usize,
    },
    #[error("code '{code}' contains '{symbol}', which is not in the alphabet")]
    UnknownSymbol { code: String, symbol: char },
    #[error("column '{0}' not found in codebook file")]
    MissingColumn(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Clone, Debug)]
pub struct CodebookEntry {
    pub code: String,
    pub gene: String,

    // alphabet index of each round's symbol
    pub channels: Vec<usize>,
}

/// Mapping from codes (one alphabet symbol per round) to gene names. The
/// alphabet order gives the channel order of the image stack.
#[derive(Clone, Debug)]
pub struct Codebook {
    alphabet: Vec<char>,
    code_length: usize,
    entries: Vec<CodebookEntry>,
    index: HashMap<String, usize>,
}

impl Codebook {
    // Build a codebook from (code, gene) pairs. When `code_length` is not
    // given, every code must match the length of the first.
    pub fn new(
        alphabet: Vec<char>,
        pairs: Vec<(String, String)>,
        code_length: Option<usize>,
    ) -> Result<Self, CodebookError> {
        if alphabet.is_empty() {
            return Err(CodebookError::EmptyAlphabet);
        }
        let mut symbol_index = HashMap::new();
        for (i, &symbol) in alphabet.iter().enumerate() {
            if symbol_index.insert(symbol, i).is_some() {
                return Err(CodebookError::DuplicateSymbol(symbol));
            }
        }

        let Some((first, _)) = pairs.first() else {
            return Err(CodebookError::EmptyCodebook);
        };
        let code_length = code_length.unwrap_or(first.chars().count());

        let mut entries = Vec::with_capacity(pairs.len());
        let mut index = HashMap::with_capacity(pairs.len());
        for (code, gene) in pairs {
            let found = code.chars().count();
            if found != code_length {
                return Err(CodebookError::CodeLength {
                    code,
                    expected: code_length,
                    found,
                });
            }

            let mut channels = Vec::with_capacity(code_length);
            for symbol in code.chars() {
                match symbol_index.get(&symbol) {
                    Some(&channel) => channels.push(channel),
                    None => return Err(CodebookError::UnknownSymbol { code, symbol }),
                }
            }

            if index.contains_key(&code) {
                return Err(CodebookError::DuplicateCode(code));
            }
            index.insert(code.clone(), entries.len());
            entries.push(CodebookEntry {
                code,
                gene,
                channels,
            });
        }

        Ok(Codebook {
            alphabet,
            code_length,
            entries,
            index,
        })
    }

    // Read a codebook from a CSV file, gzip compressed if the name ends in
    // ".gz".
    pub fn read_csv(
        path: &str,
        alphabet: Vec<char>,
        code_column: &str,
        gene_column: &str,
        code_length: Option<usize>,
    ) -> Result<Self, CodebookError> {
        let file = File::open(path)?;
        let input: Box<dyn Read> = if path.ends_with(".gz") {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let pairs = read_code_gene_pairs(input, code_column, gene_column)?;
        Codebook::new(alphabet, pairs, code_length)
    }

    pub fn code_length(&self) -> usize {
        self.code_length
    }

    pub fn n_symbols(&self) -> usize {
        self.alphabet.len()
    }

    pub fn entries(&self) -> &[CodebookEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn gene(&self, code: &str) -> Option<&str> {
        self.index
            .get(code)
            .map(|&i| self.entries[i].gene.as_str())
    }

    // Spell out a code from per-round channel indices.
    pub fn code_for_channels(&self, channels: &[usize]) -> String {
        channels.iter().map(|&c| self.alphabet[c]).collect()
    }
}

fn find_column(headers: &csv::StringRecord, column: &str) -> Result<usize, CodebookError> {
    headers
        .iter()
        .position(|x| x == column)
        .ok_or_else(|| CodebookError::MissingColumn(column.to_string()))
}

fn read_code_gene_pairs<R: Read>(
    input: R,
    code_column: &str,
    gene_column: &str,
) -> Result<Vec<(String, String)>, CodebookError> {
    let mut rdr = csv::Reader::from_reader(input);
    let headers = rdr.headers()?;
    let code_col = find_column(headers, code_column)?;
    let gene_col = find_column(headers, gene_column)?;

    let mut pairs = Vec::new();
    for result in rdr.records() {
        let row = result?;
        pairs.push((row[code_col].trim().to_string(), row[gene_col].to_string()));
    }
    Ok(pairs)
}
