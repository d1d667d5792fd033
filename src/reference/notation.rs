//! Text form of reference chains, used in logs and tests.
//!
//! ```text
//! %2@16<8> (:,3,1:9:2,:4,2:,[1,3]_4)<4> +24<8>
//! ```
//!
//! `%index[@offset]` is a registered component, `+offset` a plain field and a
//! parenthesised list an array reference; every node ends with its item size
//! in angle brackets. Vector subscripts default to kind 8.

use std::fmt;
use std::str::FromStr;

use miette::{Diagnostic, SourceSpan};
use nom::{
    IResult, Parser as NomParser,
    branch::alt,
    character::complete::{char, digit1, space0},
    combinator::{map_res, opt, recognize},
    error::{Error as NomError, ErrorKind},
    multi::{many1, separated_list1},
    sequence::{delimited, pair, preceded},
};
use thiserror::Error;

use super::{ArrayRef, ComponentRef, IndexVector, RefChain, RefNode, Reference, Subscript};

#[derive(Debug, Error, Diagnostic, Clone, PartialEq)]
#[error("{message}")]
#[diagnostic(code(caf::notation))]
pub struct NotationError {
    #[source_code]
    src: String,
    #[label("{label}")]
    span: SourceSpan,
    message: String,
    label: String,
}

impl NotationError {
    fn at(src: &str, offset: usize, message: impl Into<String>, label: &str) -> Self {
        let len = if offset < src.len() { 1 } else { 0 };
        Self {
            src: src.to_string(),
            span: (offset, len).into(),
            message: message.into(),
            label: label.to_string(),
        }
    }

    pub fn offset(&self) -> usize {
        self.span.offset()
    }
}

fn unsigned(input: &str) -> IResult<&str, usize> {
    map_res(digit1, |s: &str| s.parse::<usize>()).parse(input)
}

fn signed(input: &str) -> IResult<&str, isize> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| s.parse::<isize>()).parse(input)
}

fn wide_signed(input: &str) -> IResult<&str, i128> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| s.parse::<i128>()).parse(input)
}

fn comma(input: &str) -> IResult<&str, char> {
    delimited(space0, char(','), space0).parse(input)
}

fn registered_component(input: &str) -> IResult<&str, Reference> {
    let (input, _) = char('%')(input)?;
    let (input, index) = unsigned(input)?;
    let (input, offset) = opt(preceded(char('@'), unsigned)).parse(input)?;
    let component = ComponentRef::Registered {
        index,
        offset: offset.unwrap_or(0),
    };
    Ok((input, Reference::Component(component)))
}

fn field(input: &str) -> IResult<&str, Reference> {
    let (input, _) = char('+')(input)?;
    let (input, offset) = unsigned(input)?;
    Ok((input, Reference::Component(ComponentRef::Field { offset })))
}

fn vector_subscript(input: &str) -> IResult<&str, Subscript> {
    let (input, _) = char('[')(input)?;
    let (input, _) = space0(input)?;
    let (input, values) = separated_list1(comma, wide_signed).parse(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = char(']')(input)?;
    let (rest, kind) =
        opt(preceded(char('_'), map_res(digit1, |s: &str| s.parse::<i32>()))).parse(input)?;
    let vector = IndexVector::from_values(kind.unwrap_or(8), &values)
        .map_err(|_| nom::Err::Failure(NomError::new(input, ErrorKind::Verify)))?;
    Ok((rest, Subscript::Vector(vector)))
}

fn triplet_subscript(input: &str) -> IResult<&str, Subscript> {
    let start_input = input;
    let (input, start) = opt(signed).parse(input)?;
    let (input, tail) = opt(preceded(
        char(':'),
        pair(opt(signed), opt(preceded(char(':'), signed))),
    ))
    .parse(input)?;
    let subscript = match (start, tail) {
        (Some(index), None) => Subscript::Single(index),
        (None, Some((None, None))) => Subscript::Full,
        (None, Some((Some(end), stride))) => Subscript::OpenStart {
            end,
            stride: stride.unwrap_or(1),
        },
        (Some(start), Some((None, stride))) => Subscript::OpenEnd {
            start,
            stride: stride.unwrap_or(1),
        },
        (Some(start), Some((Some(end), stride))) => Subscript::Range {
            start,
            end,
            stride: stride.unwrap_or(1),
        },
        (None, Some((None, Some(_)))) | (None, None) => {
            return Err(nom::Err::Error(NomError::new(start_input, ErrorKind::Verify)));
        }
    };
    Ok((input, subscript))
}

fn subscript(input: &str) -> IResult<&str, Subscript> {
    alt((vector_subscript, triplet_subscript)).parse(input)
}

fn array(input: &str) -> IResult<&str, Reference> {
    let (input, _) = char('(')(input)?;
    let (input, _) = space0(input)?;
    let (input, subscripts) = separated_list1(comma, subscript).parse(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = char(')')(input)?;
    Ok((input, Reference::Array(ArrayRef { subscripts })))
}

fn node(input: &str) -> IResult<&str, RefNode> {
    let (input, _) = space0(input)?;
    let (input, reference) = alt((registered_component, field, array)).parse(input)?;
    let (input, item_size) = delimited(char('<'), unsigned, char('>')).parse(input)?;
    Ok((input, RefNode {
        reference,
        item_size,
    }))
}

pub fn parse_chain(src: &str) -> Result<RefChain, NotationError> {
    let offset_of = |rest: &str| src.len() - rest.len();
    let (rest, nodes) = match many1(node).parse(src) {
        Ok(parsed) => parsed,
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            return Err(NotationError::at(
                src,
                offset_of(e.input),
                "malformed reference chain",
                "unexpected input",
            ));
        }
        Err(nom::Err::Incomplete(_)) => {
            return Err(NotationError::at(src, src.len(), "incomplete reference chain", "here"));
        }
    };
    let rest = rest.trim_start();
    if !rest.is_empty() {
        return Err(NotationError::at(
            src,
            offset_of(rest),
            "trailing input after reference chain",
            "not part of any node",
        ));
    }
    RefChain::new(nodes).map_err(|err| NotationError::at(src, 0, err.to_string(), "chain starts here"))
}

impl FromStr for RefChain {
    type Err = NotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_chain(s)
    }
}

fn write_stride(f: &mut fmt::Formatter<'_>, stride: isize) -> fmt::Result {
    if stride != 1 {
        write!(f, ":{stride}")?;
    }
    Ok(())
}

impl fmt::Display for Subscript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscript::Full => write!(f, ":"),
            Subscript::Single(index) => write!(f, "{index}"),
            Subscript::Range { start, end, stride } => {
                write!(f, "{start}:{end}")?;
                write_stride(f, *stride)
            }
            Subscript::OpenEnd { start, stride } => {
                write!(f, "{start}:")?;
                write_stride(f, *stride)
            }
            Subscript::OpenStart { end, stride } => {
                write!(f, ":{end}")?;
                write_stride(f, *stride)
            }
            Subscript::Vector(indices) => {
                let values: Vec<String> = indices.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", values.join(","))?;
                if indices.kind() != 8 {
                    write!(f, "_{}", indices.kind())?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for RefNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Component(ComponentRef::Registered { index, offset }) => {
                write!(f, "%{index}")?;
                if *offset != 0 {
                    write!(f, "@{offset}")?;
                }
            }
            Reference::Component(ComponentRef::Field { offset }) => write!(f, "+{offset}")?,
            Reference::Array(array) => {
                let subscripts: Vec<String> =
                    array.subscripts.iter().map(|s| s.to_string()).collect();
                write!(f, "({})", subscripts.join(","))?;
            }
        }
        write!(f, "<{}>", self.item_size)
    }
}

impl fmt::Display for RefChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{node}")?;
        }
        Ok(())
    }
}
