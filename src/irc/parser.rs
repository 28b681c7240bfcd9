//! Parser combinators for the minimal IRCv3 grammar Twitch speaks.
//!
//! Ported from an `irc.rs` that targeted `nom` 5 to `nom` 7's combinator
//! names; the grammar itself -- tags, prefix, command, middle/trailing
//! params -- is unchanged.

use fnv::FnvHashMap;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1, take_while_m_n};
use nom::character::complete::{alpha1, char};
use nom::combinator::{opt, recognize, verify};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, preceded, terminated, tuple};
use nom::{AsChar, IResult};
use std::convert::identity;
use std::iter::FromIterator;

/// A borrowed, parsed IRC line.
#[derive(Debug, Eq, PartialEq)]
pub struct IrcLine<'a> {
    pub tags: Option<FnvHashMap<&'a str, &'a str>>,
    pub prefix: Option<IrcPrefix<'a>>,
    pub command: &'a str,
    pub params: Vec<&'a str>,
}

impl<'a> IrcLine<'a> {
    /// Parse a single CRLF-stripped IRC line.
    pub fn parse(input: &'a str) -> IResult<&'a str, IrcLine<'a>> {
        let (remaining, (tags, prefix, command, params)) =
            tuple((irc_tags, opt(irc_prefix), command, command_params))(input)?;
        Ok((
            remaining,
            IrcLine {
                tags,
                prefix,
                command,
                params,
            },
        ))
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct IrcPrefix<'a> {
    pub host: Option<&'a str>,
    pub nick: Option<&'a str>,
    pub user: Option<&'a str>,
}

/// Parse an IRC command name (alphabetic verb or 3-digit numeric reply).
fn command(input: &str) -> IResult<&str, &str> {
    alt((alpha1, numeric_command))(input)
}

fn numeric_command(input: &str) -> IResult<&str, &str> {
    take_while_m_n(3, 3, |c: char| c.is_dec_digit())(input)
}

fn command_params(input: &str) -> IResult<&str, Vec<&str>> {
    many0(preceded(spaces1, alt((trailing_param, middle_param))))(input)
}

fn middle_param(input: &str) -> IResult<&str, &str> {
    verify(take_while1(|c: char| !"\r\n\0 ".contains(c)), |s: &str| {
        !s.starts_with(':')
    })(input)
}

fn trailing_param(input: &str) -> IResult<&str, &str> {
    preceded(tag(":"), take_while(|c: char| !"\r\n\0".contains(c)))(input)
}

fn irc_prefix(input: &str) -> IResult<&str, IrcPrefix<'_>> {
    let (remaining, (nick_or_server, user, host)) = delimited(
        char(':'),
        tuple((
            take_while1(|chr| !"! ".contains(chr)),
            opt(preceded(tag("!"), take_while1(|chr| !"@ ".contains(chr)))),
            opt(preceded(tag("@"), not_spaces1)),
        )),
        char(' '),
    )(input)?;

    Ok((
        remaining,
        match (nick_or_server, user, host) {
            (nick_or_server, None, None) => {
                if nick_or_server.contains('.') {
                    IrcPrefix {
                        host: Some(nick_or_server),
                        user: None,
                        nick: None,
                    }
                } else {
                    IrcPrefix {
                        host: None,
                        user: None,
                        nick: Some(nick_or_server),
                    }
                }
            }
            (nick_or_server, opt_user, Some(host)) => IrcPrefix {
                host: Some(host),
                user: opt_user,
                nick: Some(nick_or_server),
            },
            (nick_or_server, opt_user, None) => IrcPrefix {
                host: Some(nick_or_server),
                user: opt_user,
                nick: None,
            },
        },
    ))
}

fn irc_tags(input: &str) -> IResult<&str, Option<FnvHashMap<&str, &str>>> {
    let (remaining, list_opt) = opt(delimited(
        char('@'),
        separated_list0(char(';'), irc_tag),
        spaces0,
    ))(input)?;
    Ok((
        remaining,
        list_opt.map(|list| {
            FnvHashMap::from_iter(
                list.into_iter()
                    .filter_map(|(k, v)| v.map(|v| (k, v))),
            )
        }),
    ))
}

fn irc_tag(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    let (remaining, (key, val)) = tuple((
        irc_tag_key,
        opt(preceded(
            char('='),
            opt(take_while1(|c: char| !" ;".contains(c))),
        )),
    ))(input)?;
    Ok((remaining, (key, val.and_then(identity))))
}

/// Parse just the key of an IRCv3 tag, including an optional client (`+`)
/// prefix and vendor namespace (`vendor/`).
fn irc_tag_key(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        opt(char('+')),
        opt(terminated(take_while1(|c| !"=/".contains(c)), char('/'))),
        take_while1(|c: char| c.is_alphanumeric() || c == '-'),
    )))(input)
}

fn not_spaces1(input: &str) -> IResult<&str, &str> {
    take_while1(|c| c != ' ')(input)
}

fn spaces1(input: &str) -> IResult<&str, &str> {
    take_while1(|c| c == ' ')(input)
}

fn spaces0(input: &str) -> IResult<&str, &str> {
    take_while(|c| c == ' ')(input)
}
